use super::HelperProcessError;

/// Number of lines following the type line of each event type, `None` for
/// types the protocol does not know.
pub type LineTable = fn(u8) -> Option<usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParserState {
    AwaitingType,
    AwaitingLines {
        kind: u8,
        remaining: usize,
        lines: Vec<String>,
    },
}

/// Splits a helper's output into events. A record is one line holding the
/// event type as a single character counted from `'0'`, followed by as
/// many lines as the table says.
#[derive(Debug, Clone)]
pub struct EventParser {
    table: LineTable,
    state: ParserState,
}

impl EventParser {
    pub fn new(table: LineTable) -> Self {
        Self {
            table,
            state: ParserState::AwaitingType,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ParserState::AwaitingType
    }

    /// Consumes one line without its terminator. Returns a record once its
    /// last line arrived.
    pub fn feed(&mut self, line: &str) -> Result<Option<(u8, Vec<String>)>, HelperProcessError> {
        match &mut self.state {
            ParserState::AwaitingType => {
                let mut chars = line.chars();
                let (Some(c), None) = (chars.next(), chars.next()) else {
                    return Err(HelperProcessError::Malformed(line.to_owned()));
                };
                let kind = u32::from(c)
                    .checked_sub(u32::from('0'))
                    .and_then(|k| u8::try_from(k).ok())
                    .ok_or(HelperProcessError::UnknownEvent(c))?;
                let count = (self.table)(kind).ok_or(HelperProcessError::UnknownEvent(c))?;
                if count == 0 {
                    return Ok(Some((kind, vec![])));
                }
                self.state = ParserState::AwaitingLines {
                    kind,
                    remaining: count,
                    lines: Vec::with_capacity(count),
                };
                Ok(None)
            }
            ParserState::AwaitingLines {
                kind,
                remaining,
                lines,
            } => {
                lines.push(line.to_owned());
                *remaining -= 1;
                if *remaining > 0 {
                    return Ok(None);
                }
                let record = (*kind, std::mem::take(lines));
                self.state = ParserState::AwaitingType;
                Ok(Some(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(kind: u8) -> Option<usize> {
        match kind {
            0 => Some(1),
            1 => Some(0),
            8 => Some(3),
            _ => None,
        }
    }

    #[test]
    fn records_of_different_arity() {
        let mut parser = EventParser::new(table);
        assert_eq!(parser.feed("1").unwrap(), Some((1, vec![])));
        assert_eq!(parser.feed("8").unwrap(), None);
        assert!(!parser.is_idle());
        assert_eq!(parser.feed("-rw-r--r-- 1 u g 10 Jan 1 2024 a").unwrap(), None);
        // payload lines may look like type lines
        assert_eq!(parser.feed("0").unwrap(), None);
        assert_eq!(
            parser.feed("a").unwrap(),
            Some((
                8,
                vec![
                    "-rw-r--r-- 1 u g 10 Jan 1 2024 a".to_owned(),
                    "0".to_owned(),
                    "a".to_owned()
                ]
            ))
        );
        assert!(parser.is_idle());
        assert_eq!(parser.feed("0").unwrap(), None);
        assert_eq!(parser.feed("ok").unwrap(), Some((0, vec!["ok".to_owned()])));
    }

    #[test]
    fn rejects_unknown_types() {
        let mut parser = EventParser::new(table);
        assert!(matches!(
            parser.feed("7"),
            Err(HelperProcessError::UnknownEvent('7'))
        ));
        assert!(matches!(
            parser.feed("00"),
            Err(HelperProcessError::Malformed(_))
        ));
        assert!(matches!(parser.feed(""), Err(HelperProcessError::Malformed(_))));
    }
}
