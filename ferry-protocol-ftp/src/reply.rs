use bytes::BytesMut;

/// Longest line we buffer before giving up on the server.
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpReply {
    pub fn class(&self) -> u16 {
        self.code / 100
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == 1
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    pub fn is_intermediate(&self) -> bool {
        self.class() == 3
    }

    /// Text of the last line without the code.
    pub fn text(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or_default())
            .unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("line too long")]
    LineTooLong,
}

/// Splits the control connection's byte stream into replies, joining
/// `123-` continuation blocks.
#[derive(Debug, Default)]
pub struct ReplyReader {
    buffer: BytesMut,
    multiline: Option<FtpReply>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.multiline = None;
    }

    fn next_line(&mut self) -> Result<Option<String>, ReplyError> {
        loop {
            let Some(end) = self.buffer.iter().position(|b| *b == b'\n' || *b == 0) else {
                if self.buffer.len() > MAX_LINE_LENGTH {
                    return Err(ReplyError::LineTooLong);
                }
                return Ok(None);
            };
            let line = self.buffer.split_to(end + 1);
            let line = String::from_utf8_lossy(&line[..end]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                return Ok(Some(line.to_owned()));
            }
        }
    }

    /// The next complete reply, if one is buffered.
    pub fn next_reply(&mut self) -> Result<Option<FtpReply>, ReplyError> {
        while let Some(line) = self.next_line()? {
            let code = parse_code(&line);
            let separator = line.as_bytes().get(3).copied();
            match self.multiline.as_mut() {
                Some(reply) => {
                    let last = code == Some(reply.code) && separator != Some(b'-');
                    reply.lines.push(line);
                    if last {
                        return Ok(self.multiline.take());
                    }
                }
                None => {
                    let Some(code) = code else {
                        // stray text outside any reply
                        continue;
                    };
                    let reply = FtpReply {
                        code,
                        lines: vec![line],
                    };
                    if separator == Some(b'-') {
                        self.multiline = Some(reply);
                    } else {
                        return Ok(Some(reply));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn parse_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
        return None;
    }
    match line.as_bytes().get(3) {
        None | Some(b' ') | Some(b'-') => digits.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_multiline_replies_across_reads() {
        let mut reader = ReplyReader::new();
        reader.feed(b"220 Welcome\r\n211-Features:\r\n MDTM\r\n SIZ");
        let welcome = reader.next_reply().unwrap().unwrap();
        assert_eq!(welcome.code, 220);
        assert_eq!(welcome.text(), "Welcome");
        assert_eq!(reader.next_reply().unwrap(), None);

        reader.feed(b"E\r\n211-not the end\r\n211 End\r\n200");
        let features = reader.next_reply().unwrap().unwrap();
        assert_eq!(features.code, 211);
        assert_eq!(
            features.lines,
            vec!["211-Features:", " MDTM", " SIZE", "211-not the end", "211 End"]
        );
        assert_eq!(reader.next_reply().unwrap(), None);
        reader.feed(b"\n");
        assert_eq!(reader.next_reply().unwrap().unwrap().code, 200);
    }

    #[test]
    fn garbage_between_replies_is_skipped() {
        let mut reader = ReplyReader::new();
        reader.feed(b"hello\r\n\r\n331 Password required\n");
        let reply = reader.next_reply().unwrap().unwrap();
        assert_eq!(reply.code, 331);
        assert!(reply.is_intermediate());
    }

    #[test]
    fn overlong_lines_are_an_error() {
        let mut reader = ReplyReader::new();
        reader.feed(&vec![b'x'; MAX_LINE_LENGTH + 1]);
        assert_eq!(reader.next_reply(), Err(ReplyError::LineTooLong));
    }
}
