use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_LOG_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Info,
    Http,
    QueryGen,
    Worker,
    Reflection,
    Finalizer,
}

impl Kind {
    pub fn tag(&self) -> &'static str {
        match self {
            Kind::Info => "info",
            Kind::Http => "http",
            Kind::QueryGen => "query-gen",
            Kind::Worker => "worker",
            Kind::Reflection => "reflection",
            Kind::Finalizer => "finalizer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub text: String,
    pub kind: Kind,
}

static VERBOSE_LOG: Lazy<Mutex<VecDeque<Entry>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(MAX_LOG_LINES)));

pub fn log<T: Into<String>>(line: T) {
    log_with(Kind::Info, line);
}

pub fn log_with<T: Into<String>>(kind: Kind, line: T) {
    if let Ok(mut buf) = VERBOSE_LOG.lock() {
        if buf.len() >= MAX_LOG_LINES {
            buf.pop_front();
        }
        buf.push_back(Entry {
            text: line.into(),
            kind,
        });
    }
}

pub fn recent(n: usize) -> Vec<Entry> {
    if let Ok(buf) = VERBOSE_LOG.lock() {
        let len = buf.len();
        let take = n.min(len);
        buf.iter().skip(len - take).cloned().collect()
    } else {
        Vec::new()
    }
}

pub fn clear() {
    if let Ok(mut buf) = VERBOSE_LOG.lock() {
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_recent() {
        clear();
        log("first");
        log_with(Kind::Worker, "second");

        let entries = recent(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].text, "second");
        assert_eq!(entries[1].kind.tag(), "worker");
    }
}
