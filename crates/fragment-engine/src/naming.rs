use std::sync::OnceLock;

use regex::Regex;

use fragment_core::ids::EphemeralId;

/// Platform limit on room names, in characters.
pub const MAX_ROOM_NAME: usize = 100;

/// Length of the ` [<32 hex>]` suffix every fragment name carries.
pub const TOKEN_SUFFIX_LEN: usize = 35;

/// Longest name an owner can choose that survives without shortening.
pub const MAX_CHOSEN_NAME: usize = MAX_ROOM_NAME - TOKEN_SUFFIX_LEN;

/// Name for a fragment of `parent_name`: the parent name followed by the
/// bracketed token. The parent part is shortened so the token always fits.
pub fn fragment_name(parent_name: &str, id: &EphemeralId) -> String {
    let suffix = format!(" [{}]", id.token());
    let budget = MAX_ROOM_NAME.saturating_sub(suffix.chars().count());
    let parent: String = parent_name.trim().chars().take(budget).collect();
    format!("{}{suffix}", parent.trim_end())
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[([0-9a-f]{32})\]$").expect("static regex"))
}

/// Recover the ephemeral id from a room name produced by [`fragment_name`].
pub fn parse_fragment_name(name: &str) -> Option<EphemeralId> {
    token_pattern()
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| EphemeralId::from_token(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_token() {
        let id = EphemeralId::new();
        let name = fragment_name("Gaming", &id);
        assert!(name.starts_with("Gaming ["));
        assert_eq!(parse_fragment_name(&name), Some(id));
    }

    #[test]
    fn chosen_name_limit_fits_exactly() {
        let id = EphemeralId::new();
        let chosen = "y".repeat(MAX_CHOSEN_NAME);
        let name = fragment_name(&chosen, &id);
        assert_eq!(name.chars().count(), MAX_ROOM_NAME);
        assert!(name.starts_with(&chosen));
    }

    #[test]
    fn long_parent_names_are_shortened() {
        let id = EphemeralId::new();
        let name = fragment_name(&"x".repeat(300), &id);
        assert_eq!(name.chars().count(), MAX_ROOM_NAME);
        assert_eq!(parse_fragment_name(&name), Some(id));
    }

    #[test]
    fn multibyte_names_are_cut_on_char_boundaries() {
        let id = EphemeralId::new();
        let name = fragment_name(&"é".repeat(120), &id);
        assert!(name.chars().count() <= MAX_ROOM_NAME);
        assert!(parse_fragment_name(&name).is_some());
    }

    #[test]
    fn ordinary_names_do_not_match() {
        assert_eq!(parse_fragment_name("General"), None);
        assert_eq!(parse_fragment_name("Room [abc]"), None);
        assert_eq!(
            parse_fragment_name("Room [0123456789ABCDEF0123456789ABCDEF]"),
            None
        );
    }
}
