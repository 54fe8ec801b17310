/// A line typed on stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Chat(String),
    /// Three signed direction bytes, sent as input.
    Move([u8; 3]),
    Status,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Chat(line.to_string()));
        };

        let mut words = rest.split_whitespace();
        match words.next()? {
            "quit" | "q" => Some(Command::Quit),
            "status" => Some(Command::Status),
            "move" => {
                let mut payload = [0u8; 3];
                for byte in payload.iter_mut() {
                    let axis: f32 = words.next()?.parse().ok()?;
                    *byte = (axis.clamp(-1.0, 1.0) * 127.0).round() as i8 as u8;
                }
                Some(Command::Move(payload))
            }
            other => {
                log::warn!("Unknown command /{}", other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(
            Command::parse("  hello there "),
            Some(Command::Chat("hello there".into()))
        );
        assert_eq!(Command::parse("   "), None);
    }

    #[test]
    fn move_encodes_signed_bytes() {
        assert_eq!(
            Command::parse("/move 1 0 -1"),
            Some(Command::Move([127, 0, 0x81]))
        );
        assert_eq!(Command::parse("/move 1 0"), None);
        assert_eq!(Command::parse("/move a b c"), None);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(Command::parse("/quit"), Some(Command::Quit));
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("/dance"), None);
    }
}
