//! Author names: random defaults and validation.

#[cfg(test)]
#[path = "names_test.rs"]
mod tests;

use rand::Rng;

use crate::error::ValidationError;

pub const MAX_AUTHOR_LEN: usize = 20;

const ADJECTIVES: &[&str] = &["Happy", "Creative", "Artistic", "Colorful", "Bright", "Vibrant", "Cool", "Amazing"];
const NOUNS: &[&str] = &["Artist", "Painter", "Creator", "Designer", "Maker", "Builder", "Craftsman", "Genius"];

/// Generate a default author name like `VibrantPainter412`.
#[must_use]
pub fn random_author() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    let number = rng.random_range(0..1000);
    format!("{adjective}{noun}{number}")
}

/// Trim and check an author name.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidAuthor`] when the trimmed name is empty
/// or longer than [`MAX_AUTHOR_LEN`] characters.
pub fn validate_author(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::InvalidAuthor("name is empty".to_owned()));
    }
    if name.chars().count() > MAX_AUTHOR_LEN {
        return Err(ValidationError::InvalidAuthor(format!("name exceeds {MAX_AUTHOR_LEN} characters")));
    }
    Ok(name.to_owned())
}
