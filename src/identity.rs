//! Random identifier generation.
//!
//! Used to auto-generate slugs for apps and terminals registered without an
//! explicit one. The alphabet omits easily-confused characters (I, L, O, X).

/// Characters permitted in a generated identifier.
const IDENTITY_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTUVWYZ";

/// Length of a generated identifier.
const IDENTITY_SIZE: usize = 12;

/// Generate a random identifier of the default size.
#[must_use]
pub fn generate() -> String {
    generate_sized(IDENTITY_SIZE)
}

/// Generate a random identifier of the given size.
#[must_use]
pub fn generate_sized(size: usize) -> String {
    (0..size)
        .map(|_| {
            let index = rand::random::<u32>() as usize % IDENTITY_ALPHABET.len();
            IDENTITY_ALPHABET[index] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_length() {
        assert_eq!(generate().len(), IDENTITY_SIZE);
        assert_eq!(generate_sized(4).len(), 4);
    }

    #[test]
    fn test_generate_uses_alphabet() {
        let identity = generate();
        assert!(identity
            .bytes()
            .all(|byte| IDENTITY_ALPHABET.contains(&byte)));
    }

    #[test]
    fn test_generate_is_random() {
        // Two 12-character draws colliding would be a one in 32^12 event.
        assert_ne!(generate(), generate());
    }
}
