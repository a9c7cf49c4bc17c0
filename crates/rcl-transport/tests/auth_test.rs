//! Integration test: handshake authentication helpers
//!
//! Run with: cargo test -p rcl-transport --test auth_test -- --nocapture

use rcl_transport::auth;

#[test]
fn test_challenge_response() {
    let challenge = auth::generate_challenge(32);
    assert_eq!(challenge.len(), 32);

    let response = auth::compute_challenge_response("secret", &challenge);
    assert_eq!(response.len(), 32);
    assert!(auth::verify_challenge_response("secret", &challenge, &response));

    assert!(!auth::verify_challenge_response("other", &challenge, &response));
    assert!(!auth::verify_challenge_response("secret", &auth::generate_challenge(32), &response));
    assert!(!auth::verify_challenge_response("secret", &challenge, &response[..16]));
}

#[test]
fn test_empty_token_still_authenticates() {
    let challenge = auth::generate_challenge(16);
    let response = auth::compute_challenge_response("", &challenge);
    assert!(!response.is_empty());
    assert!(auth::verify_challenge_response("", &challenge, &response));
}

#[test]
fn test_generate_token() {
    let token = auth::generate_token(32);
    println!("{}", token);
    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(token, auth::generate_token(32));
}
