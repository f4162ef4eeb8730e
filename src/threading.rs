use uuid::Uuid;

/// Where a message belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Inherited from a stored ancestor.
    Existing(String),
    /// No ancestor is known; the message opens this freshly minted thread.
    New(String),
}

impl Resolution {
    pub fn thread_id(&self) -> &str {
        match self {
            Resolution::Existing(id) | Resolution::New(id) => id,
        }
    }
}

/// Assigns a message to a thread from its linkage headers.
///
/// `In-Reply-To` is checked first. Failing that, `references` is scanned in
/// header order (oldest ancestor first) and the first known entry wins, so
/// a long conversation stays anchored to its oldest reachable message.
/// `find_thread_for` maps a stored message id to its thread.
pub fn resolve_thread<F>(
    in_reply_to: Option<&str>,
    references: &[String],
    find_thread_for: F,
) -> Resolution
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(thread_id) = in_reply_to.and_then(&find_thread_for) {
        return Resolution::Existing(thread_id);
    }

    references
        .iter()
        .find_map(|r| find_thread_for(r))
        .map(Resolution::Existing)
        .unwrap_or_else(|| Resolution::New(mint_thread_id()))
}

pub fn mint_thread_id() -> String {
    Uuid::new_v4().to_string()
}
