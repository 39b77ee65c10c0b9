/// Key layout for identity-namespaced snapshots
///
/// - signed in: `{store}_user_{identity_id}`
/// - anonymous: `{store}_anonymous`

pub const ANONYMOUS_SUFFIX: &str = "anonymous";
const USER_PREFIX: &str = "user_";

/// Suffix identifying the namespace of `identity`
pub fn identity_suffix(identity: Option<&str>) -> String {
    match identity {
        Some(id) => format!("{}{}", USER_PREFIX, id),
        None => ANONYMOUS_SUFFIX.to_string(),
    }
}

/// Encode a snapshot key: {store}_{identity-suffix}
pub fn namespaced_key(store: &str, identity: Option<&str>) -> String {
    format!("{}_{}", store, identity_suffix(identity))
}

/// Prefix shared by every namespace of `store`: {store}_
pub fn store_prefix(store: &str) -> String {
    format!("{}_", store)
}

/// Decode a snapshot key for `store` into its identity (`None` = anonymous)
pub fn decode_namespaced_key(key: &str, store: &str) -> Option<Option<String>> {
    let suffix = key.strip_prefix(&store_prefix(store))?;
    if suffix == ANONYMOUS_SUFFIX {
        return Some(None);
    }
    suffix
        .strip_prefix(USER_PREFIX)
        .filter(|id| !id.is_empty())
        .map(|id| Some(id.to_string()))
}
