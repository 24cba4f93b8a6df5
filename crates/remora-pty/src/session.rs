use anyhow::{Context, Result};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::termios::{self, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, execvp, fork, read, setsid, write, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// The child shell running inside a pseudo-terminal. The wrapper owns
/// the master side; the slave becomes the shell's controlling terminal.
pub struct ShellPty {
    master_fd: OwnedFd,
    child_pid: Pid,
}

/// Environment marker so a nested wrapper can detect it is already
/// running inside one.
pub const SHELL_MARKER: (&str, &str) = ("REMORA_SHELL", "1");

impl ShellPty {
    /// Fork the shell with `shell_binary` as argv0 inside a fresh PTY.
    /// The child inherits the parent environment plus the session marker
    /// and `extra_env`.
    pub fn spawn(shell_binary: &str, extra_env: HashMap<String, String>) -> Result<Self> {
        let OpenptyResult { master, slave } = openpty(None, None).context("openpty failed")?;

        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                drop(master);

                setsid().ok();
                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0);
                }

                dup2(slave.as_raw_fd(), 0).ok();
                dup2(slave.as_raw_fd(), 1).ok();
                dup2(slave.as_raw_fd(), 2).ok();
                if slave.as_raw_fd() > 2 {
                    drop(slave);
                }

                std::env::set_var(SHELL_MARKER.0, SHELL_MARKER.1);
                for (key, value) in &extra_env {
                    std::env::set_var(key, value);
                }

                let c_cmd = CString::new(shell_binary).unwrap();
                let c_args = [c_cmd.clone()];
                execvp(&c_cmd, &c_args).ok();
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                drop(slave);
                Ok(ShellPty {
                    master_fd: master,
                    child_pid: child,
                })
            }
        }
    }

    pub fn master_raw_fd(&self) -> RawFd {
        self.master_fd.as_raw_fd()
    }

    pub fn child_pid(&self) -> i32 {
        self.child_pid.as_raw()
    }

    /// Blocking read from the master side. Returns 0 on child EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = read(self.master_fd.as_raw_fd(), buf).context("read from PTY master")?;
        Ok(n)
    }

    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = write(&self.master_fd, &data[written..]).context("write to PTY master")?;
            written += n;
        }
        Ok(())
    }

    pub fn set_window_size(&self, rows: u16, cols: u16) -> Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let ret = unsafe { libc::ioctl(self.master_fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            anyhow::bail!("ioctl TIOCSWINSZ failed");
        }
        Ok(())
    }

    pub fn wait(&self) -> Result<i32> {
        match waitpid(self.child_pid, None)? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
            _ => Ok(-1),
        }
    }
}

/// Current size of the wrapper's own terminal, or `None` when stdin is
/// not a terminal.
pub fn terminal_size() -> Option<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(0, libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 {
        Some((ws.ws_row, ws.ws_col))
    } else {
        None
    }
}

/// Saved line-discipline settings for the wrapper's own stdin. The
/// parent terminal stays raw for the whole session so keystrokes reach
/// the multiplexer one byte at a time instead of line-buffered; the
/// child's slave side keeps its own discipline untouched.
///
/// Restores the saved settings on drop. Callers must drop this before
/// `process::exit`, which skips destructors and would leave the user's
/// terminal raw.
pub struct RawModeGuard {
    saved: Termios,
}

/// Switch the wrapper's stdin to raw mode for the session.
pub fn enter_raw_mode() -> Result<RawModeGuard> {
    let stdin = std::io::stdin();
    let saved = termios::tcgetattr(&stdin).context("tcgetattr on stdin")?;
    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("tcsetattr raw on stdin")?;
    Ok(RawModeGuard { saved })
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &self.saved);
    }
}
