use std::collections::VecDeque;

/// Bounded buffer of a plugin's most recent output lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a line, evicting the oldest once full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// The last `n` lines, oldest first. `None` returns everything.
    pub fn tail(&self, n: Option<usize>) -> Vec<String> {
        let n = n.unwrap_or(self.lines.len()).min(self.lines.len());
        self.lines.iter().skip(self.lines.len() - n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_bounded() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.tail(None), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_tail_limits_and_clamps() {
        let mut buffer = LogBuffer::new(10);
        buffer.push("a");
        buffer.push("b");
        buffer.push("c");
        assert_eq!(buffer.tail(Some(2)), vec!["b", "c"]);
        assert_eq!(buffer.tail(Some(50)), vec!["a", "b", "c"]);
        assert!(buffer.tail(Some(0)).is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_one_line() {
        let mut buffer = LogBuffer::new(0);
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.tail(None), vec!["b"]);
        assert!(!buffer.is_empty());
    }
}
