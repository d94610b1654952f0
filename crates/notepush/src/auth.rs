use crate::{Error, Result};

use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tnostr::{FilledKeypair, Note, NoteBuilder, Pubkey};

/// NIP-98 style HTTP authentication event kind.
pub const HTTP_AUTH_KIND: u32 = 27235;

/// The canonicalized request tuple an auth note is checked against.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub url: &'a str,
    pub method: &'a str,
    pub body: Option<&'a [u8]>,
}

fn canonical_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => url.to_owned(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build a signed auth note for an outgoing request.
pub fn auth_note(keys: FilledKeypair<'_>, request: &AuthRequest<'_>) -> Result<Note> {
    let mut builder = NoteBuilder::new()
        .kind(HTTP_AUTH_KIND)
        .content("")
        .tag(vec!["u".to_owned(), canonical_url(request.url)])
        .tag(vec!["method".to_owned(), request.method.to_uppercase()]);
    if let Some(body) = request.body {
        builder = builder.tag(vec![
            "payload".to_owned(),
            hex::encode(Sha256::digest(body)),
        ]);
    }
    builder.sign(keys).map_err(Error::Wire)
}

/// Verify an inbound auth note against the request it claims to cover.
/// The full hash/signature path runs first; url, method, freshness and
/// body hash are checked against the canonicalized request, then the
/// optional allow-list. Returns the authenticated pubkey.
pub fn verify_auth_note(
    note: &Note,
    request: &AuthRequest<'_>,
    allowed: Option<&[Pubkey]>,
    max_age: Duration,
) -> Result<Pubkey> {
    if note.kind != HTTP_AUTH_KIND {
        return Err(Error::Unauthorized(format!(
            "wrong event kind: {}",
            note.kind
        )));
    }
    note.verify().map_err(Error::Wire)?;

    let url = note
        .tag_values("u")
        .next()
        .ok_or_else(|| Error::Unauthorized("missing u tag".to_owned()))?;
    if canonical_url(url) != canonical_url(request.url) {
        return Err(Error::Unauthorized("url mismatch".to_owned()));
    }

    let method = note
        .tag_values("method")
        .next()
        .ok_or_else(|| Error::Unauthorized("missing method tag".to_owned()))?;
    if !method.eq_ignore_ascii_case(request.method) {
        return Err(Error::Unauthorized("method mismatch".to_owned()));
    }

    let now = unix_now();
    let age = now.abs_diff(note.created_at);
    if age > max_age.as_secs() {
        return Err(Error::Unauthorized("stale auth event".to_owned()));
    }

    if let Some(body) = request.body {
        let expected = hex::encode(Sha256::digest(body));
        let payload = note
            .tag_values("payload")
            .next()
            .ok_or_else(|| Error::Unauthorized("missing payload tag".to_owned()))?;
        if payload != expected {
            return Err(Error::Unauthorized("payload hash mismatch".to_owned()));
        }
    }

    if let Some(allowed) = allowed {
        if !allowed.contains(&note.pubkey) {
            return Err(Error::Unauthorized("pubkey not in allow list".to_owned()));
        }
    }

    Ok(note.pubkey)
}
