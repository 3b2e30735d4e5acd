use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Random alphanumeric string used for OAuth `state` values and OAuth1 nonces.
pub fn random_token(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
