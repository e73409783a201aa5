//! Constructors for the supported kernel operations.
//!
//! Each function prepares one submission entry and wraps it in an [`Op`]
//! future; nothing touches the kernel until the op is first polled. Raw
//! results follow the kernel convention: non-negative is op-specific
//! success, negative errnos are decoded into [`IoError::Os`].
//!
//! [`IoError::Os`]: crate::io::IoError::Os

use crate::io::Op;
use io_uring::opcode;
use io_uring::types::{Fd, FsyncFlags};
use std::ffi::CStr;
use std::os::fd::RawFd;

/// No-op, completes with result 0. Useful for draining and tests.
pub fn nop() -> Op<'static> {
    Op::new(opcode::Nop::new().build())
}

/// Opens `path` relative to `dirfd` (pass `libc::AT_FDCWD` for the working
/// directory).
pub fn openat(dirfd: RawFd, path: &CStr, flags: i32, mode: u32) -> Op<'_> {
    Op::new(
        opcode::OpenAt::new(Fd(dirfd), path.as_ptr())
            .flags(flags)
            .mode(mode)
            .build(),
    )
}

pub fn read(fd: RawFd, buf: &mut [u8], offset: u64) -> Op<'_> {
    Op::new(
        opcode::Read::new(Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .offset(offset)
            .build(),
    )
}

pub fn write(fd: RawFd, buf: &[u8], offset: u64) -> Op<'_> {
    Op::new(
        opcode::Write::new(Fd(fd), buf.as_ptr(), buf.len() as u32)
            .offset(offset)
            .build(),
    )
}

pub fn readv(fd: RawFd, iovecs: &mut [libc::iovec], offset: u64) -> Op<'_> {
    Op::new(
        opcode::Readv::new(Fd(fd), iovecs.as_mut_ptr(), iovecs.len() as u32)
            .offset(offset)
            .build(),
    )
}

pub fn writev(fd: RawFd, iovecs: &[libc::iovec], offset: u64) -> Op<'_> {
    Op::new(
        opcode::Writev::new(Fd(fd), iovecs.as_ptr(), iovecs.len() as u32)
            .offset(offset)
            .build(),
    )
}

pub fn fsync(fd: RawFd) -> Op<'static> {
    Op::new(opcode::Fsync::new(Fd(fd)).build())
}

/// Flushes data only, skipping metadata when possible.
pub fn fdatasync(fd: RawFd) -> Op<'static> {
    Op::new(
        opcode::Fsync::new(Fd(fd))
            .flags(FsyncFlags::DATASYNC)
            .build(),
    )
}

pub fn close(fd: RawFd) -> Op<'static> {
    Op::new(opcode::Close::new(Fd(fd)).build())
}

/// Creates a socket; completes with the new descriptor.
pub fn socket(domain: i32, socket_type: i32, protocol: i32) -> Op<'static> {
    Op::new(opcode::Socket::new(domain, socket_type, protocol).build())
}

/// `addr` must outlive the op.
pub fn connect(fd: RawFd, addr: &libc::sockaddr, addrlen: libc::socklen_t) -> Op<'_> {
    Op::new(opcode::Connect::new(Fd(fd), addr, addrlen).build())
}

/// Accepts one connection; the peer address is written through `addr` and
/// `addrlen` when provided. Completes with the accepted descriptor.
pub fn accept<'a>(
    fd: RawFd,
    addr: Option<(&'a mut libc::sockaddr, &'a mut libc::socklen_t)>,
    flags: i32,
) -> Op<'a> {
    let (addr_ptr, len_ptr) = match addr {
        Some((addr, len)) => (addr as *mut libc::sockaddr, len as *mut libc::socklen_t),
        None => (std::ptr::null_mut(), std::ptr::null_mut()),
    };
    Op::new(
        opcode::Accept::new(Fd(fd), addr_ptr, len_ptr)
            .flags(flags)
            .build(),
    )
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> Op<'_> {
    Op::new(
        opcode::Send::new(Fd(fd), buf.as_ptr(), buf.len() as u32)
            .flags(flags)
            .build(),
    )
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> Op<'_> {
    Op::new(
        opcode::Recv::new(Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .flags(flags)
            .build(),
    )
}

/// Datagram send to an explicit destination. `addr` must outlive the op.
pub fn send_to<'a>(
    fd: RawFd,
    buf: &'a [u8],
    flags: i32,
    addr: &'a libc::sockaddr,
    addrlen: libc::socklen_t,
) -> Op<'a> {
    Op::new(
        opcode::Send::new(Fd(fd), buf.as_ptr(), buf.len() as u32)
            .flags(flags)
            .dest_addr(addr)
            .dest_addr_len(addrlen)
            .build(),
    )
}

/// Scatter-gather send; the message header and everything it points at
/// must outlive the op.
pub fn sendmsg(fd: RawFd, msg: &libc::msghdr, flags: u32) -> Op<'_> {
    Op::new(opcode::SendMsg::new(Fd(fd), msg).flags(flags).build())
}

/// Scatter-gather receive; also the recvfrom path, with the source address
/// returned through `msg.msg_name`.
pub fn recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: u32) -> Op<'_> {
    Op::new(opcode::RecvMsg::new(Fd(fd), msg).flags(flags).build())
}

/// `how` is one of `libc::SHUT_RD`, `SHUT_WR`, `SHUT_RDWR`.
pub fn shutdown(fd: RawFd, how: i32) -> Op<'static> {
    Op::new(opcode::Shutdown::new(Fd(fd), how).build())
}
