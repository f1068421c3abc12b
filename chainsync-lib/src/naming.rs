use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid pattern {pattern}: {source}")]
    Pattern { pattern: String, source: regex::Error },
    #[error("Chain prefix must not be empty")]
    EmptyChainPrefix,
    #[error("Hash prefix must not be empty")]
    EmptyHashPrefix,
}

/// Settings deciding which chains and rules belong to this synchronizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingOptions {
    pub chain_prefix: String,
    pub historic_prefixes: Vec<String>,
    pub hash_prefix: String,
    pub extra_cleanup_pattern: Option<String>,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            chain_prefix: "cali-".to_string(),
            historic_prefixes: vec!["felix-".to_string()],
            hash_prefix: "cali:".to_string(),
            extra_cleanup_pattern: None,
        }
    }
}

/// Compiled ownership rules. One per table, never shared global state.
#[derive(Clone, Debug)]
pub struct Ownership {
    chain_prefix: String,
    historic_prefixes: Vec<String>,
    hash_prefix: String,
    hash_re: Regex,
    historic_jump_re: Option<Regex>,
    extra_cleanup_re: Option<Regex>,
    reference_re: Regex,
    quoted_re: Regex,
}

fn compile(pattern: String) -> Result<Regex, Error> {
    Regex::new(&pattern).map_err(|source| Error::Pattern { pattern, source })
}

impl Ownership {
    pub fn new(opts: &NamingOptions) -> Result<Self, Error> {
        if opts.chain_prefix.is_empty() {
            return Err(Error::EmptyChainPrefix);
        }
        if opts.hash_prefix.is_empty() {
            return Err(Error::EmptyHashPrefix);
        }

        let hash_re = compile(format!(
            r#"--comment "?{}([a-zA-Z0-9_-]+)"?"#,
            regex::escape(&opts.hash_prefix)
        ))?;

        let historic: Vec<String> = opts
            .historic_prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| regex::escape(p))
            .collect();
        let historic_jump_re = if historic.is_empty() {
            None
        } else {
            Some(compile(format!(
                r"(?:^|\s)(?:-j|--jump|-g|--goto)\s+(?:{})",
                historic.join("|")
            ))?)
        };
        let extra_cleanup_re = opts
            .extra_cleanup_pattern
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| compile(p.clone()))
            .transpose()?;

        let reference_re = compile(r"(?:^|\s)(?:-j|--jump|-g|--goto)\s+(\S+)".to_string())?;
        let quoted_re = compile(r#""[^"]*""#.to_string())?;

        Ok(Self {
            chain_prefix: opts.chain_prefix.clone(),
            historic_prefixes: opts.historic_prefixes.clone(),
            hash_prefix: opts.hash_prefix.clone(),
            hash_re,
            historic_jump_re,
            extra_cleanup_re,
            reference_re,
            quoted_re,
        })
    }

    pub fn hash_prefix(&self) -> &str {
        &self.hash_prefix
    }

    /// Chain is fully managed by us.
    pub fn is_owned(&self, chain: &str) -> bool {
        chain.starts_with(&self.chain_prefix)
    }

    /// Chain was created by us, now or by an earlier naming scheme.
    pub fn is_ours_or_historic(&self, chain: &str) -> bool {
        self.is_owned(chain)
            || self
                .historic_prefixes
                .iter()
                .any(|p| !p.is_empty() && chain.starts_with(p.as_str()))
    }

    pub fn extract_hash(&self, line: &str) -> Option<String> {
        self.hash_re
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Rule text with quoted arguments blanked, so comments cannot look like options.
    fn unquoted<'a>(&self, line: &'a str) -> std::borrow::Cow<'a, str> {
        self.quoted_re.replace_all(line, "\"\"")
    }

    /// Rule left behind by an earlier version or matched by the operator's cleanup pattern.
    ///
    /// The cleanup pattern sees the whole line, comments included.
    pub fn is_legacy_insert(&self, line: &str) -> bool {
        self.historic_jump_re
            .as_ref()
            .is_some_and(|re| re.is_match(&self.unquoted(line)))
            || self.extra_cleanup_re.as_ref().is_some_and(|re| re.is_match(line))
    }

    /// Jump or goto target of a rule line.
    pub fn reference(&self, line: &str) -> Option<String> {
        self.reference_re
            .captures(&self.unquoted(line))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}
