//! Session and controlling terminal setup for interactive launches.
//!
//! Everything here except [`is_terminal`] and [`sane_termios`] runs in the
//! child between fork and exec, so it only makes async-signal-safe calls.

use crate::child::ChildError;
use nix::errno::Errno;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices as Cc, Termios,
};
use nix::unistd::{self, getpid, setsid, tcsetpgrp};
use std::os::unix::io::{BorrowedFd, RawFd};

#[cfg(target_os = "freebsd")]
const VDISABLE: libc::cc_t = 0xff;
#[cfg(not(target_os = "freebsd"))]
const VDISABLE: libc::cc_t = 0;

const fn ctrl(c: u8) -> libc::cc_t {
    (c & 0x1f) as libc::cc_t
}

/// Whether `fd` refers to a terminal device.
pub fn is_terminal(fd: RawFd) -> bool {
    unistd::isatty(fd).unwrap_or(false)
}

/// Reset `tios` to the system's default interactive line discipline.
pub fn sane_termios(tios: &mut Termios) -> nix::Result<()> {
    tios.input_flags = InputFlags::BRKINT
        | InputFlags::ICRNL
        | InputFlags::IMAXBEL
        | InputFlags::IXON
        | InputFlags::IXANY;
    tios.output_flags = OutputFlags::OPOST | OutputFlags::ONLCR;
    tios.local_flags = LocalFlags::ECHO
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN
        | LocalFlags::ECHOE
        | LocalFlags::ECHOKE
        | LocalFlags::ECHOCTL;
    tios.control_flags = ControlFlags::CREAD | ControlFlags::CS8 | ControlFlags::HUPCL;

    let cc = &mut tios.control_chars;
    cc[Cc::VEOF as usize] = ctrl(b'd');
    cc[Cc::VEOL as usize] = VDISABLE;
    cc[Cc::VEOL2 as usize] = VDISABLE;
    cc[Cc::VERASE as usize] = 0x7f;
    cc[Cc::VWERASE as usize] = ctrl(b'w');
    cc[Cc::VKILL as usize] = ctrl(b'u');
    cc[Cc::VREPRINT as usize] = ctrl(b'r');
    cc[Cc::VINTR as usize] = ctrl(b'c');
    cc[Cc::VQUIT as usize] = 0x1c;
    cc[Cc::VSUSP as usize] = ctrl(b'z');
    cc[Cc::VSTART as usize] = ctrl(b'q');
    cc[Cc::VSTOP as usize] = ctrl(b's');
    cc[Cc::VLNEXT as usize] = ctrl(b'v');
    cc[Cc::VDISCARD as usize] = ctrl(b'o');
    cc[Cc::VMIN as usize] = 1;
    cc[Cc::VTIME as usize] = 0;
    #[cfg(target_os = "freebsd")]
    {
        cc[Cc::VDSUSP as usize] = ctrl(b'y');
        cc[Cc::VSTATUS as usize] = ctrl(b't');
    }

    termios::cfsetspeed(tios, BaudRate::B9600)
}

/// Start a new session with `tty` as its controlling terminal.
///
/// The calling process becomes session and foreground process group leader,
/// and the terminal is reset to a sane mode.
pub fn become_session_leader(tty: RawFd) -> Result<(), ChildError> {
    setsid().map_err(|e| ChildError::new("setsid", e))?;

    let ret = unsafe { libc::ioctl(tty, libc::TIOCSCTTY as _, 0) };
    Errno::result(ret).map_err(|e| ChildError::new("ioctl TIOCSCTTY", e))?;

    tcsetpgrp(tty, getpid()).map_err(|e| ChildError::new("tcsetpgrp", e))?;

    // the descriptor stays open for the whole call
    let fd = unsafe { BorrowedFd::borrow_raw(tty) };
    let mut tios = termios::tcgetattr(fd).map_err(|e| ChildError::new("tcgetattr", e))?;
    sane_termios(&mut tios).map_err(|e| ChildError::new("cfsetspeed", e))?;
    termios::tcsetattr(fd, SetArg::TCSANOW, &tios).map_err(|e| ChildError::new("tcsetattr", e))?;
    Ok(())
}
