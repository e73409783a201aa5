use riptide::time::{MissedTickBehavior, interval, sleep, sleep_until};
use riptide::{Builder, Runtime};
use std::time::{Duration, Instant};

fn runtime(workers: usize) -> Runtime {
    Builder::new()
        .num_workers(workers)
        .try_build()
        .expect("failed to build runtime")
}

#[test]
fn test_sleep_lower_bound() {
    let rt = runtime(2);

    let elapsed = rt.block_on(async {
        let start = Instant::now();
        sleep(Duration::from_millis(10)).await;
        start.elapsed()
    });

    assert!(elapsed >= Duration::from_millis(8), "elapsed = {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(100), "elapsed = {elapsed:?}");
}

#[test]
fn test_zero_sleep_yields_but_completes() {
    let rt = runtime(2);

    let loops = rt.block_on(async {
        let mut loops = 0u32;
        for _ in 0..1_000 {
            sleep(Duration::ZERO).await;
            loops += 1;
        }
        loops
    });
    assert_eq!(loops, 1_000);
}

#[test]
fn test_sleep_until_past_deadline_returns_quickly() {
    let rt = runtime(2);

    let elapsed = rt.block_on(async {
        let start = Instant::now();
        sleep_until(Instant::now() - Duration::from_millis(50)).await;
        start.elapsed()
    });
    assert!(elapsed < Duration::from_millis(50), "elapsed = {elapsed:?}");
}

// Wake times across sequential sleeps on one task are monotone.
#[test]
fn test_sequential_sleeps_are_monotone() {
    let rt = runtime(2);

    let stamps = rt.block_on(async {
        let mut stamps = Vec::with_capacity(8);
        for ms in [1u64, 5, 2, 8, 3, 1, 4, 2] {
            sleep(Duration::from_millis(ms)).await;
            stamps.push(Instant::now());
        }
        stamps
    });

    for pair in stamps.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
}

#[test]
fn test_long_sleep_crosses_wheel_levels() {
    let rt = runtime(2);

    // 200 ms lands beyond the 64 ms level-0 span, exercising promotion
    // and cascade.
    let elapsed = rt.block_on(async {
        let start = Instant::now();
        sleep(Duration::from_millis(200)).await;
        start.elapsed()
    });
    assert!(elapsed >= Duration::from_millis(198), "elapsed = {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(500), "elapsed = {elapsed:?}");
}

#[test]
fn test_interval_ticks_at_least_period_apart() {
    let rt = runtime(2);

    let (count, elapsed) = rt.block_on(async {
        let start = Instant::now();
        let mut ticker = interval(Duration::from_millis(5));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut count = 0u32;
        for _ in 0..4 {
            ticker.tick().await;
            count += 1;
        }
        (count, start.elapsed())
    });

    assert_eq!(count, 4);
    assert!(elapsed >= Duration::from_millis(18), "elapsed = {elapsed:?}");
}

#[test]
fn test_many_concurrent_sleepers() {
    let rt = runtime(4);

    let done = rt.block_on(async {
        let (tx, rx) = riptide::sync::channel::bounded::<u32>(64);
        for i in 0..64u64 {
            let tx = tx.clone();
            riptide::spawn(async move {
                sleep(Duration::from_millis(i % 16 + 1)).await;
                let _ = tx.send(1).await;
            });
        }

        let mut done = 0;
        for _ in 0..64 {
            done += rx.recv().await.unwrap();
        }
        done
    });
    assert_eq!(done, 64);
}
