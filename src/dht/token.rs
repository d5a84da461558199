//! `announce_peer` token issuance and verification (BEP 5 §"Tokens").
use super::TOKEN_ROTATION_INTERVAL_SECS;
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const SECRET_LEN: usize = 8;
const TOKEN_LEN: usize = 8;

fn random_secret() -> [u8; SECRET_LEN] {
    use rand::Rng;
    rand::rng().random()
}

fn compute(secret: &[u8; SECRET_LEN], ip: IpAddr, info_hash: &[u8; 20]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.update(secret);
    hasher.update(info_hash);
    hasher.finalize()[..TOKEN_LEN].to_vec()
}

/// Issues and verifies `announce_peer` tokens, rotating the underlying
/// secret hourly while keeping the previous one valid.
pub struct TokenManager {
    current: [u8; SECRET_LEN],
    previous: Option<[u8; SECRET_LEN]>,
    last_rotation: Instant,
}

impl TokenManager {
    pub fn new() -> Self {
        Self { current: random_secret(), previous: None, last_rotation: Instant::now() }
    }

    pub fn maybe_rotate(&mut self) {
        if self.last_rotation.elapsed() >= Duration::from_secs(TOKEN_ROTATION_INTERVAL_SECS) {
            self.previous = Some(self.current);
            self.current = random_secret();
            self.last_rotation = Instant::now();
        }
    }

    pub fn issue(&self, ip: IpAddr, info_hash: &[u8; 20]) -> Vec<u8> {
        compute(&self.current, ip, info_hash)
    }

    pub fn verify(&self, token: &[u8], ip: IpAddr, info_hash: &[u8; 20]) -> bool {
        if token == compute(&self.current, ip, info_hash) {
            return true;
        }
        self.previous.is_some_and(|prev| token == compute(&prev, ip, info_hash))
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_against_the_current_secret() {
        let manager = TokenManager::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let info_hash = [9u8; 20];
        let token = manager.issue(ip, &info_hash);
        assert!(manager.verify(&token, ip, &info_hash));
    }

    #[test]
    fn token_is_scoped_to_ip_and_info_hash() {
        let manager = TokenManager::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let other_ip: IpAddr = "5.6.7.8".parse().unwrap();
        let info_hash = [9u8; 20];
        let token = manager.issue(ip, &info_hash);
        assert!(!manager.verify(&token, other_ip, &info_hash));
        assert!(!manager.verify(&token, ip, &[1u8; 20]));
    }

    #[test]
    fn previous_secret_remains_valid_after_rotation() {
        let mut manager = TokenManager::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let info_hash = [9u8; 20];
        let token = manager.issue(ip, &info_hash);

        manager.previous = Some(manager.current);
        manager.current = random_secret();

        assert!(manager.verify(&token, ip, &info_hash));
    }

    #[test]
    fn stale_token_from_two_rotations_ago_is_rejected() {
        let mut manager = TokenManager::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let info_hash = [9u8; 20];
        let token = manager.issue(ip, &info_hash);

        manager.previous = Some(manager.current);
        manager.current = random_secret();
        manager.previous = Some(manager.current);
        manager.current = random_secret();

        assert!(!manager.verify(&token, ip, &info_hash));
    }
}
