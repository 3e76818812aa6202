/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Owned file descriptors and the close-on-exec launch pipe.

use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;
use std::os::unix::io::RawFd;

use syscalls::Errno;

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    /// Takes ownership of a raw file descriptor.
    pub fn new(fd: RawFd) -> Self {
        assert_ne!(fd, -1);
        Self(fd)
    }

    /// Duplicates this descriptor on top of `newfd`, closing whatever `newfd`
    /// was before. The duplicate does not have the close-on-exec flag set.
    pub fn dup2(&self, newfd: RawFd) -> Result<Fd, Errno> {
        let fd = Errno::result(unsafe { libc::dup2(self.0, newfd) })?;
        Ok(Fd(fd))
    }

    /// Discards the descriptor without closing it.
    pub fn leave_open(self) {
        core::mem::forget(self);
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.0) };
    }
}

impl Read for Fd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = Errno::result(unsafe {
            libc::read(
                self.0,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len() as libc::size_t,
            )
        })?;

        Ok(res as usize)
    }
}

impl Write for Fd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = Errno::result(unsafe {
            libc::write(
                self.0,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::size_t,
            )
        })?;

        Ok(res as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl FromRawFd for Fd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::new(fd)
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        core::mem::forget(self);
        fd
    }
}

/// Creates an anonymous pipe, returning the `(reader, writer)` ends.
///
/// Both ends have the close-on-exec flag set: a successful `execvp` in a
/// forked child closes its copy of the writer, which the parent observes as
/// end-of-file. Only a child that failed to exec can send bytes back.
pub fn pipe() -> Result<(Fd, Fd), Errno> {
    let mut fds = [-1, -1];
    Errno::result(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok((Fd::new(fds[0]), Fd::new(fds[1])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (mut reader, mut writer) = pipe().unwrap();
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
    }

    #[test]
    fn pipe_is_cloexec() {
        let (reader, writer) = pipe().unwrap();
        for fd in [&reader, &writer] {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }
}
