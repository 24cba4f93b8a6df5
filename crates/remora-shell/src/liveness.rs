//! Child-process liveness: is anything running under the wrapped shell
//! right now? When a command (or a full-screen program) is running, the
//! wrapper stays out of the way and passes bytes through verbatim.
//!
//! Descendants are counted by walking /proc; nested interactive shells
//! are excluded so a `bash` inside the session still gets wrapper
//! behavior.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const EXCLUDED_COMMS: &[&str] = &["sh", "bash", "zsh"];

/// Parse one /proc/<pid>/stat line into (pid, comm, ppid). The comm
/// field is parenthesized and may itself contain spaces or parens, so
/// split on the last closing paren.
fn parse_stat(line: &str) -> Option<(i32, String, i32)> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let pid: i32 = line[..open].trim().parse().ok()?;
    let comm = line[open + 1..close].to_string();
    let rest: Vec<&str> = line[close + 1..].split_whitespace().collect();
    let ppid: i32 = rest.get(1)?.parse().ok()?;
    Some((pid, comm, ppid))
}

/// Count descendant processes of `root_pid`, excluding nested
/// interactive shells.
pub fn count_running_children(root_pid: i32) -> usize {
    let mut children: HashMap<i32, Vec<(i32, String)>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid_str) = name.to_str() else { continue };
        if !pid_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((pid, comm, ppid)) = parse_stat(&stat) {
            children.entry(ppid).or_default().push((pid, comm));
        }
    }

    let mut count = 0;
    let mut queue = VecDeque::from([root_pid]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for (kid, comm) in kids {
                if !EXCLUDED_COMMS.contains(&comm.as_str()) {
                    count += 1;
                }
                queue.push_back(*kid);
            }
        }
    }
    count
}

/// TTL-cached liveness check. The /proc walk is cheap but not free, and
/// the multiplexer consults this on every input chunk.
pub struct LivenessCache {
    cached: bool,
    checked_at: Option<Instant>,
    ttl: Duration,
    root_pid: i32,
}

impl LivenessCache {
    pub fn new(root_pid: i32, ttl: Duration) -> Self {
        Self {
            cached: false,
            checked_at: None,
            ttl,
            root_pid,
        }
    }

    pub fn has_running_children(&mut self) -> bool {
        let stale = match self.checked_at {
            None => true,
            Some(t) => t.elapsed() >= self.ttl,
        };
        if stale {
            self.cached = count_running_children(self.root_pid) > 0;
            self.checked_at = Some(Instant::now());
        }
        self.cached
    }

    /// The cached value without refreshing.
    pub fn cached(&self) -> bool {
        self.cached
    }

    /// Override the cache; used when a PS1 suffix proves the foreground
    /// command finished.
    pub fn force(&mut self, value: bool) {
        self.cached = value;
        self.checked_at = Some(Instant::now());
    }

    /// Drop the cache so the next check rescans.
    pub fn invalidate(&mut self) {
        self.checked_at = None;
    }
}

/// Bounded, sanitized tail of child output captured while a full-screen
/// program owns the terminal. Flushed into history when passthrough
/// ends so the model still sees what the user was looking at.
pub struct TuiTail {
    buf: String,
    max_bytes: usize,
}

pub const DEFAULT_TUI_TAIL_BYTES: usize = 4096;

impl TuiTail {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: String::new(),
            max_bytes,
        }
    }

    /// Append already-sanitized text, discarding the oldest bytes once
    /// over the window.
    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.max_bytes {
            let cut = self.buf.len() - self.max_bytes;
            let mut boundary = cut;
            while boundary < self.buf.len() && !self.buf.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.buf.drain(..boundary);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_basic() {
        let (pid, comm, ppid) = parse_stat("123 (cat) R 45 123 45 0 -1").unwrap();
        assert_eq!(pid, 123);
        assert_eq!(comm, "cat");
        assert_eq!(ppid, 45);
    }

    #[test]
    fn test_parse_stat_comm_with_spaces_and_parens() {
        let (pid, comm, ppid) = parse_stat("9 (tmux: server (1)) S 1 9 9 0 -1").unwrap();
        assert_eq!(pid, 9);
        assert_eq!(comm, "tmux: server (1)");
        assert_eq!(ppid, 1);
    }

    #[test]
    fn test_count_children_of_self() {
        // this test process spawns a sleeping child and must see it
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let count = count_running_children(std::process::id() as i32);
        assert!(count >= 1, "expected to see the sleep child, got {count}");
        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn test_liveness_cache_force_holds_for_ttl() {
        let mut cache = LivenessCache::new(1, Duration::from_secs(60));
        cache.force(true);
        assert!(cache.cached());
        // within the TTL the forced value is returned without a rescan
        assert!(cache.has_running_children());
        cache.force(false);
        assert!(!cache.has_running_children());
    }

    #[test]
    fn test_tui_tail_bounded() {
        let mut tail = TuiTail::new(16);
        for _ in 0..10 {
            tail.push("0123456789");
        }
        assert!(tail.len() <= 16);
        let text = tail.take();
        assert!(text.ends_with("0123456789"));
        assert!(tail.is_empty());
    }

    #[test]
    fn test_tui_tail_keeps_newest() {
        let mut tail = TuiTail::new(8);
        tail.push("aaaa");
        tail.push("bbbb");
        tail.push("cccc");
        assert_eq!(tail.take(), "bbbbcccc");
    }

    #[test]
    fn test_tui_tail_char_boundary() {
        let mut tail = TuiTail::new(6);
        tail.push("ab🐠🐠"); // 2 + 4 + 4 bytes
        assert!(tail.len() <= 6);
        let s = tail.take();
        assert!(s.chars().count() > 0);
        assert!(std::str::from_utf8(s.as_bytes()).is_ok());
    }
}
