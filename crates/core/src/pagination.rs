//! Bounded, token-resumable listings.
//!
//! Every listing (commit entries, snapshot keys, three-way diffs) is keyed
//! by page key in ascending order, so a continuation token is simply the
//! first key not yet returned, prefixed with a fingerprint of the listing
//! that issued it. A token presented to a different listing is rejected.

use sha2::{Digest, Sha256};

use crate::errors::PaginationError;
use crate::models::{Paginated, Token};

const FINGERPRINT_LEN: usize = 8;

/// Upper bounds for a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    /// Maximum number of items per page.
    pub max_items: usize,
    /// Maximum summed key and value bytes per page. A single oversized item
    /// is still returned on its own page.
    pub max_bytes: usize,
}

impl PageLimits {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            max_bytes: max_bytes.max(1),
        }
    }
}

/// Identifies the listing a token was issued by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub(crate) fn of(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Self(out)
    }

    fn token(&self, resume_key: &[u8]) -> Token {
        let mut bytes = Vec::with_capacity(FINGERPRINT_LEN + resume_key.len());
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(resume_key);
        Token(bytes)
    }

    /// The key a listing should resume from, or `None` to start at the
    /// beginning.
    pub(crate) fn resume_key<'t>(
        &self,
        token: Option<&'t Token>,
    ) -> Result<Option<&'t [u8]>, PaginationError> {
        let Some(token) = token else {
            return Ok(None);
        };
        let bytes = token.as_bytes();
        if bytes.len() <= FINGERPRINT_LEN || bytes[..FINGERPRINT_LEN] != self.0 {
            return Err(PaginationError::InvalidToken);
        }
        Ok(Some(&bytes[FINGERPRINT_LEN..]))
    }
}

/// Collect one page from `items`, which must already start at the resume
/// key and be in ascending key order.
///
/// The page is partial only when another item actually follows, and the
/// token then points at that item.
pub(crate) fn paginate<T, I, K, S>(
    items: I,
    limits: PageLimits,
    fingerprint: Fingerprint,
    key_of: K,
    size_of: S,
) -> Paginated<T>
where
    I: IntoIterator<Item = T>,
    K: Fn(&T) -> &[u8],
    S: Fn(&T) -> usize,
{
    let mut page = Vec::new();
    let mut bytes = 0usize;
    for item in items {
        let size = size_of(&item);
        let full = page.len() >= limits.max_items || bytes + size > limits.max_bytes;
        if full && !page.is_empty() {
            let token = fingerprint.token(key_of(&item));
            return Paginated::partial(page, token);
        }
        bytes += size;
        page.push(item);
    }
    Paginated::complete(page)
}
