//! Maps OpenAI-style model names to CLA model aliases.

use gw_domain::error::Error;

const PREFIX_RULES: &[(&str, &str)] = &[
    ("gpt-4o-2024-", "sonnet"),
    ("gpt-4-turbo-2024-", "sonnet"),
    ("gpt-3.5-turbo-", "haiku"),
];

pub fn exact_map() -> &'static [(&'static str, &'static str)] {
    &[
        ("gpt-4o", "sonnet"),
        ("gpt-4o-mini", "haiku"),
        ("gpt-4", "opus"),
        ("gpt-4-turbo", "sonnet"),
        ("gpt-3.5-turbo", "haiku"),
        ("opus", "opus"),
        ("sonnet", "sonnet"),
        ("haiku", "haiku"),
    ]
}

/// Resolves an OpenAI or CLA model name to a CLA alias: exact match first,
/// then ordered prefix rules. The error message enumerates every exact-map
/// key when nothing matches.
pub fn map_model(requested: &str) -> Result<&'static str, Error> {
    if let Some((_, alias)) = exact_map().iter().find(|(name, _)| *name == requested) {
        return Ok(alias);
    }

    for (prefix, alias) in PREFIX_RULES {
        if requested.starts_with(prefix) {
            return Ok(alias);
        }
    }

    let known: Vec<&str> = exact_map().iter().map(|(name, _)| *name).collect();
    Err(Error::ModelNotFound(format!(
        "{requested} (known models: {})",
        known.join(", ")
    )))
}
