use bytes::BytesMut;

use crate::Line;

/// Bytes read from an input but not yet handed out as lines.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: BytesMut,
    /// Prefix of `pending` already known to hold no `\n`.
    scanned: usize,
    /// Prefix of `pending` that came from a previous input.
    carried: usize,
}

impl LineBuffer {
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Mark everything held as belonging to the input being left behind. Those
    /// bytes are not counted in the length of the line they end up in.
    pub(crate) fn carry(&mut self) {
        self.carried = self.pending.len();
    }

    /// Split off the first complete line, terminator included.
    pub(crate) fn take_line(&mut self) -> Option<Line> {
        let Some(end) = self.pending[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
        else {
            self.scanned = self.pending.len();
            return None;
        };
        let raw = self.pending.split_to(self.scanned + end + 1);
        Some(self.line(&raw))
    }

    /// Take whatever remains, complete or not.
    pub(crate) fn take_remainder(&mut self) -> Option<Line> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = self.pending.split();
        Some(self.line(&raw))
    }

    fn line(&mut self, raw: &[u8]) -> Line {
        let carried = std::mem::take(&mut self.carried).min(raw.len());
        self.scanned = 0;
        Line {
            text: String::from_utf8_lossy(raw).into_owned(),
            len: (raw.len() - carried) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LineBuffer;

    fn text(line: Option<crate::Line>) -> Option<String> {
        line.map(|line| line.text)
    }

    #[test]
    fn fragment_is_held_until_completed() {
        let mut buf = LineBuffer::default();
        buf.extend(b"SELECT 1");
        assert_eq!(buf.take_line(), None);

        buf.extend(b";\nSELECT");
        assert_eq!(text(buf.take_line()).as_deref(), Some("SELECT 1;\n"));
        assert_eq!(buf.take_line(), None);
        assert_eq!(text(buf.take_remainder()).as_deref(), Some("SELECT"));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn invalid_utf8_keeps_raw_length() {
        let mut buf = LineBuffer::default();
        buf.extend(b"a\xffb\nc\n");
        let line = buf.take_line().expect("line");
        assert_eq!(line.text, "a\u{fffd}b\n");
        assert_eq!(line.len, 4);
        assert_eq!(buf.take_line().expect("line").len, 2);
    }

    #[test]
    fn carried_fragment_is_not_counted() {
        let mut buf = LineBuffer::default();
        buf.extend(b"1\n23");
        assert_eq!(buf.take_line().expect("line").len, 2);
        assert_eq!(buf.take_line(), None);

        buf.carry();
        buf.extend(b"4\n5\n");
        let line = buf.take_line().expect("line");
        assert_eq!(line.text, "234\n");
        assert_eq!(line.len, 2);
        assert_eq!(buf.take_line().expect("line").len, 2);
    }

    #[test]
    fn many_lines_drain_in_order() {
        let mut buf = LineBuffer::default();
        for i in 0..10_000 {
            buf.extend(format!("select {i} from t;\n").as_bytes());
        }
        let mut count = 0;
        while let Some(line) = buf.take_line() {
            assert_eq!(line.text, format!("select {count} from t;\n"));
            count += 1;
        }
        assert_eq!(count, 10_000);
    }
}
