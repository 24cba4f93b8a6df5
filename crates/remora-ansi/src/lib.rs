pub mod codec;
pub mod ps1;

pub use codec::{
    classify, filter_non_printable, incomplete_csi, parse_cursor_position, sanitize, strip_ansi,
    ByteKind,
};
pub use ps1::{parse_ps1, ps1_assignment, ps1_suffix_regex, Ps1Scan, ShellKind};
