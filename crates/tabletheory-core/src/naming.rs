//! Application-name to store-name conversion (spec §4.A).

use crate::error::{Result, TableTheoryError};

/// Supported store naming conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingConvention {
    /// `userID`, `PK`, `createdAt`.
    #[default]
    CamelCase,
    /// `user_id`, `p_k`, `created_at`.
    SnakeCase,
}

/// Store names reserved for the table's own partition/sort key attributes.
/// A non-key field is never allowed to render to one of these, since it
/// would shadow the actual key attribute on the wire.
const RESERVED_STORE_NAMES: &[&str] = &["PK", "SK"];

/// Converts an application field name to its store-name rendering under
/// `convention`, acronym-aware in the camelCase direction ("PK" -> "PK",
/// "UserID" -> "userID", "ID" -> "id").
pub fn to_store_name(app_name: &str, convention: NamingConvention) -> Result<String> {
    validate_app_name(app_name)?;
    Ok(match convention {
        NamingConvention::CamelCase => to_camel_case(app_name),
        NamingConvention::SnakeCase => to_snake_case(app_name),
    })
}

/// Rejects empty names and names that collide with reserved placeholder
/// syntax.
pub fn validate_app_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TableTheoryError::InvalidTag(
            "field name must not be empty".into(),
        ));
    }
    Ok(())
}

/// Rejects store names that are empty, or that collide with `"PK"`/`"SK"`
/// without actually being the field that plays that role (`is_key`). A
/// field that legitimately is the partition or sort key renders to `"PK"`/
/// `"SK"` by design (e.g. `to_camel_case("PK") == "PK"`); a different field
/// whose name happens to render the same way would silently shadow the key
/// attribute on the wire, so that case is rejected.
pub fn validate_store_name(name: &str, is_key: bool) -> Result<()> {
    if name.is_empty() {
        return Err(TableTheoryError::InvalidTag(
            "store name must not be empty".into(),
        ));
    }
    if !is_key && RESERVED_STORE_NAMES.contains(&name) {
        return Err(TableTheoryError::InvalidTag(format!(
            "store name {name:?} is reserved for the partition/sort key"
        )));
    }
    Ok(())
}

/// Converts an identifier to camelCase, preserving leading acronym runs
/// ("ID" -> "id", "UserID" -> "userID", "PK" -> "PK").
pub fn to_camel_case(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii_uppercase()) {
        // Whole-string acronym (e.g. "PK", "ID", "SK"): left as-is.
        return name.to_string();
    }

    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(chars.len());

    // Find the leading run of uppercase letters that isn't the whole
    // string. If it's followed by a lowercase letter, the last uppercase
    // char of the run belongs to the next word (e.g. "IDValue" -> the run
    // is "ID", followed by "Value").
    let mut run_end = 0;
    while run_end < chars.len() && chars[run_end].is_ascii_uppercase() {
        run_end += 1;
    }

    if run_end == 0 {
        // Already starts lowercase.
        return name.to_string();
    }

    if run_end == chars.len() {
        // Whole identifier is uppercase but mixed with non-letters; lower
        // the first letter only.
        out.push(chars[0].to_ascii_lowercase());
        out.extend(&chars[1..]);
        return out;
    }

    // There's a following lowercase letter. If the run is more than one
    // char, the last uppercase char starts the next word (acronym
    // boundary): lowercase the whole run except the last character.
    let lower_upto = if run_end > 1 { run_end - 1 } else { run_end };
    for &c in &chars[..lower_upto] {
        out.push(c.to_ascii_lowercase());
    }
    out.extend(&chars[lower_upto..]);
    out
}

/// Converts an identifier to snake_case, splitting on uppercase-letter
/// boundaries and acronym runs ("UserID" -> "user_id", "HTTPStatus" ->
/// "http_status").
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_is_lower = i > 0 && chars[i - 1].is_ascii_lowercase();
            let next_is_lower = i + 1 < chars.len() && chars[i + 1].is_ascii_lowercase();
            let prev_is_upper = i > 0 && chars[i - 1].is_ascii_uppercase();
            if i > 0 && (prev_is_lower || (prev_is_upper && next_is_lower)) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_acronym_preserved() {
        assert_eq!(to_camel_case("PK"), "PK");
        assert_eq!(to_camel_case("ID"), "id");
    }

    #[test]
    fn camel_case_user_id() {
        assert_eq!(to_camel_case("UserID"), "userID");
    }

    #[test]
    fn camel_case_already_lower() {
        assert_eq!(to_camel_case("nickname"), "nickname");
    }

    #[test]
    fn camel_case_single_leading_upper() {
        assert_eq!(to_camel_case("Name"), "name");
    }

    #[test]
    fn snake_case_user_id() {
        assert_eq!(to_snake_case("UserID"), "user_id");
    }

    #[test]
    fn snake_case_http_status() {
        assert_eq!(to_snake_case("HTTPStatus"), "http_status");
    }

    #[test]
    fn snake_case_created_at() {
        assert_eq!(to_snake_case("createdAt"), "created_at");
    }

    #[test]
    fn empty_name_rejected() {
        assert!(validate_app_name("").is_err());
    }

    #[test]
    fn store_name_pk_sk_allowed_only_as_key() {
        assert!(validate_store_name("PK", true).is_ok());
        assert!(validate_store_name("SK", true).is_ok());
        assert!(validate_store_name("PK", false).is_err());
        assert!(validate_store_name("SK", false).is_err());
        assert!(validate_store_name("", true).is_err());
    }

    #[test]
    fn to_store_name_uses_convention() {
        assert_eq!(
            to_store_name("createdAt", NamingConvention::SnakeCase).unwrap(),
            "created_at"
        );
        assert_eq!(
            to_store_name("created_at", NamingConvention::CamelCase).unwrap(),
            "created_at"
        );
    }
}
