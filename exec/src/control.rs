//! Control pipe between the supervisor and a launched process.
//!
//! The pipe is a connected socket pair created before fork. The parent keeps
//! one end as a [`ControlChannel`]; the child keeps the other and finds it
//! through an environment variable holding the descriptor number.

use crate::config::DEFAULT_CTRL_FD_ENV;
use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::debug;

/// Which end of the pipe this instance was initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Uninitialized,
    Parent,
    Child,
}

/// A bidirectional channel created before fork.
#[derive(Debug)]
pub struct ControlPipe {
    parent: Option<OwnedFd>,
    child: Option<OwnedFd>,
    side: Side,
}

impl ControlPipe {
    /// Create the socket pair. The parent end is close-on-exec.
    pub fn new() -> Result<Self> {
        let (parent, child) = UnixStream::pair().map_err(|e| {
            Error::sys("socketpair", Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)))
        })?;
        let (parent, child) = (OwnedFd::from(parent), OwnedFd::from(child));

        // both ends start close-on-exec; the child's must survive exec
        fcntl(child.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
            .map_err(|e| Error::sys("fcntl", e))?;

        debug!(parent = parent.as_raw_fd(), child = child.as_raw_fd(), "Created control pipe");
        Ok(ControlPipe {
            parent: Some(parent),
            child: Some(child),
            side: Side::Uninitialized,
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Descriptor number the child will use.
    pub fn child_fd(&self) -> Option<RawFd> {
        self.child.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Descriptor number the parent will use.
    pub fn parent_fd(&self) -> Option<RawFd> {
        self.parent.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// `NAME=fd` entry that exports the child end to the launched program.
    pub fn env_entry(&self, var: &str) -> Result<CString> {
        let fd = self
            .child_fd()
            .ok_or_else(|| Error::ControlChannel("child end already released".to_string()))?;
        CString::new(format!("{}={}", var, fd))
            .map_err(|_| Error::InvalidRequest(format!("environment name {:?} contains NUL", var)))
    }

    /// Keep the parent end, close the child end.
    pub fn init_parent(&mut self) -> Result<ControlChannel> {
        self.claim(Side::Parent)?;
        drop(self.child.take());
        let fd = self
            .parent
            .take()
            .ok_or_else(|| Error::invariant("control pipe parent end missing"))?;
        Ok(ControlChannel::from(fd))
    }

    /// Keep the child end, close the parent end.
    ///
    /// Runs after fork; the returned descriptor stays open across exec.
    pub fn init_child(&mut self) -> Result<RawFd> {
        self.claim(Side::Child)?;
        drop(self.parent.take());
        self.child
            .take()
            .map(IntoRawFd::into_raw_fd)
            .ok_or_else(|| Error::invariant("control pipe child end missing"))
    }

    fn claim(&mut self, side: Side) -> Result<()> {
        if self.side != Side::Uninitialized {
            return Err(Error::invariant(format!(
                "control pipe already initialized as {:?}, cannot initialize as {:?}",
                self.side, side
            )));
        }
        self.side = side;
        Ok(())
    }
}

/// The supervisor's (or, inside a launched program, the child's) end of a
/// control pipe.
#[derive(Debug)]
pub struct ControlChannel {
    stream: UnixStream,
}

impl ControlChannel {
    /// Open the channel exported through the default environment variable.
    pub fn from_env() -> Result<Self> {
        Self::from_env_var(DEFAULT_CTRL_FD_ENV)
    }

    /// Open the channel exported through `name`.
    ///
    /// Meant to be called once from within the launched program; the
    /// descriptor is owned by the returned channel.
    pub fn from_env_var(name: &str) -> Result<Self> {
        let value = std::env::var(name)
            .map_err(|_| Error::ControlChannel(format!("{} is not set", name)))?;
        let fd: RawFd = value
            .trim()
            .parse()
            .map_err(|_| Error::ControlChannel(format!("{}={} is not a descriptor", name, value)))?;
        if fd < 0 {
            return Err(Error::ControlChannel(format!("{}={} is not a descriptor", name, value)));
        }

        fcntl(fd, FcntlArg::F_GETFD).map_err(|e| Error::sys("fcntl", e))?;

        Ok(ControlChannel::from(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(ControlChannel {
            stream: self.stream.try_clone()?,
        })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.stream.set_nonblocking(nonblocking)?;
        Ok(())
    }

    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

impl From<OwnedFd> for ControlChannel {
    fn from(fd: OwnedFd) -> Self {
        ControlChannel {
            stream: UnixStream::from(fd),
        }
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Read for ControlChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for ControlChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn cloexec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_parent_end_is_cloexec_child_end_is_not() {
        let pipe = ControlPipe::new().unwrap();
        assert!(cloexec(pipe.parent_fd().unwrap()));
        assert!(!cloexec(pipe.child_fd().unwrap()));
    }

    #[test]
    fn test_env_entry_names_child_fd() {
        let pipe = ControlPipe::new().unwrap();
        let entry = pipe.env_entry("VESSEL_CTRL_FD").unwrap();
        assert_eq!(
            entry.to_str().unwrap(),
            format!("VESSEL_CTRL_FD={}", pipe.child_fd().unwrap())
        );
    }

    #[test]
    fn test_parent_then_child_init_is_rejected() {
        let mut pipe = ControlPipe::new().unwrap();
        pipe.init_parent().unwrap();
        assert_eq!(pipe.side(), Side::Parent);
        assert_matches!(pipe.init_child(), Err(Error::Invariant(_)));
    }

    #[test]
    fn test_child_then_parent_init_is_rejected() {
        let mut pipe = ControlPipe::new().unwrap();
        let fd = pipe.init_child().unwrap();
        assert_matches!(pipe.init_parent(), Err(Error::Invariant(_)));
        nix::unistd::close(fd).unwrap();
    }

    #[test]
    fn test_double_parent_init_is_rejected() {
        let mut pipe = ControlPipe::new().unwrap();
        pipe.init_parent().unwrap();
        assert_matches!(pipe.init_parent(), Err(Error::Invariant(_)));
    }

    #[test]
    fn test_channel_round_trip() {
        let mut pipe = ControlPipe::new().unwrap();
        let child_fd = pipe.child_fd().unwrap();
        // keep the child end alive past init_parent
        let peer = nix::unistd::dup(child_fd).unwrap();
        let mut channel = pipe.init_parent().unwrap();
        let mut peer = unsafe { UnixStream::from_raw_fd(peer) };

        peer.write_all(b"ready\n").unwrap();
        let mut buf = [0u8; 6];
        channel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ready\n");

        channel.write_all(b"go").unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"go");
    }

    #[test]
    fn test_from_env_var_rejects_garbage() {
        std::env::set_var("VESSEL_TEST_CTRL_GARBAGE", "not-a-number");
        assert_matches!(
            ControlChannel::from_env_var("VESSEL_TEST_CTRL_GARBAGE"),
            Err(Error::ControlChannel(_))
        );
        assert_matches!(
            ControlChannel::from_env_var("VESSEL_TEST_CTRL_UNSET"),
            Err(Error::ControlChannel(_))
        );
    }

    #[test]
    fn test_from_env_var_opens_exported_fd() {
        let mut pipe = ControlPipe::new().unwrap();
        let entry = pipe.env_entry("VESSEL_TEST_CTRL_FD").unwrap();
        let value = entry.to_str().unwrap().split_once('=').unwrap().1.to_string();
        std::env::set_var("VESSEL_TEST_CTRL_FD", value);

        let child_fd = pipe.init_child().unwrap();
        let channel = ControlChannel::from_env_var("VESSEL_TEST_CTRL_FD").unwrap();
        assert_eq!(channel.as_raw_fd(), child_fd);
    }
}
