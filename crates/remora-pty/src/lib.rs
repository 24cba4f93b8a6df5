pub mod session;

pub use session::{enter_raw_mode, terminal_size, RawModeGuard, ShellPty};
