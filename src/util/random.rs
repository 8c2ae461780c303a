use rand::random;

/// salt for one login attempt
pub fn new_salt() -> u32 {
    random()
}
