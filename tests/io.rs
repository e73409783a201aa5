use riptide::io;
use riptide::{Builder, Runtime};
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

fn runtime(workers: usize) -> Runtime {
    Builder::new()
        .num_workers(workers)
        .try_build()
        .expect("failed to build runtime")
}

#[test]
fn test_nop_completes_with_zero() {
    let rt = runtime(2);
    let result = rt.block_on(async { io::nop().await.unwrap() });
    assert_eq!(result, 0);
}

#[test]
fn test_file_write_fsync_read_roundtrip() {
    let rt = runtime(2);

    let dir = tempfile::tempdir().unwrap();
    let path = CString::new(dir.path().join("data.bin").into_os_string().into_encoded_bytes())
        .unwrap();

    let payload = b"riptide write/fsync/read roundtrip".to_vec();
    let read_back = rt.block_on(async move {
        let fd = io::openat(
            libc::AT_FDCWD,
            &path,
            libc::O_CREAT | libc::O_RDWR,
            0o644,
        )
        .await
        .unwrap();

        let written = io::write(fd, &payload, 0).await.unwrap();
        assert_eq!(written as usize, payload.len());

        io::fsync(fd).await.unwrap();

        let mut buf = vec![0u8; payload.len()];
        let read = io::read(fd, &mut buf, 0).await.unwrap();
        assert_eq!(read as usize, payload.len());

        io::close(fd).await.unwrap();
        buf
    });

    assert_eq!(read_back, b"riptide write/fsync/read roundtrip".to_vec());
}

#[test]
fn test_socket_send_recv() {
    let rt = runtime(2);

    let (a, b) = UnixStream::pair().unwrap();
    let got = rt.block_on(async move {
        let sent = io::send(a.as_raw_fd(), b"ping", 0).await.unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let received = io::recv(b.as_raw_fd(), &mut buf, 0).await.unwrap();
        buf[..received as usize].to_vec()
    });

    assert_eq!(got, b"ping".to_vec());
}

// A recv that would block forever resumes with a timeout error shortly
// after the deadline, and the op is cancelled in the kernel.
#[test]
fn test_recv_timeout_fires() {
    let rt = runtime(2);

    let (a, b) = UnixStream::pair().unwrap();
    let (elapsed, err) = rt.block_on(async move {
        // Keep both ends alive so the recv cannot fail with a hangup.
        let _hold = a;
        let mut buf = [0u8; 16];

        let start = Instant::now();
        let err = io::recv(b.as_raw_fd(), &mut buf, 0)
            .timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        (start.elapsed(), err)
    });

    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert!(elapsed >= Duration::from_millis(19), "elapsed = {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(500), "elapsed = {elapsed:?}");
}

// The completion beats a generous deadline: no timeout error, and the
// timer entry is removed with the op.
#[test]
fn test_completion_wins_timeout_race() {
    let rt = runtime(2);

    let (a, b) = UnixStream::pair().unwrap();
    let got = rt.block_on(async move {
        io::send(a.as_raw_fd(), b"fast", 0).await.unwrap();

        let mut buf = [0u8; 16];
        let received = io::recv(b.as_raw_fd(), &mut buf, 0)
            .timeout(Duration::from_secs(5))
            .await
            .unwrap();
        buf[..received as usize].to_vec()
    });

    assert_eq!(got, b"fast".to_vec());
}

#[test]
fn test_many_concurrent_ops() {
    let rt = runtime(4);

    let total = rt.block_on(async {
        let (tx, rx) = riptide::sync::channel::bounded::<i32>(32);
        for _ in 0..32 {
            let tx = tx.clone();
            riptide::spawn(async move {
                let result = io::nop().await.unwrap();
                let _ = tx.send(result + 1).await;
            });
        }

        let mut total = 0;
        for _ in 0..32 {
            total += rx.recv().await.unwrap();
        }
        total
    });

    assert_eq!(total, 32);
}
