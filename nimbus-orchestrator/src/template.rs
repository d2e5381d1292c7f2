//! Extra-template payload attached at instantiation time.
//!
//! Rendered in the control plane's attribute syntax:
//!
//! ```text
//! MGMT_URL = "https://10.1.0.10/"
//! CONTEXT = [
//!   CLUSTER_CFG = "eyJtb2RlIjoiam9pbiJ9",
//!   SET_HOSTNAME = "vfxt-02" ]
//! ```

use nimbus_common::{ClusterError, ClusterResult};
use regex::Regex;

const ATTRIBUTE_KEY: &str = r"^[A-Z][A-Z0-9_]*$";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraTemplate {
    attributes: Vec<(String, String)>,
    context: Vec<(String, String)>,
}

impl ExtraTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level attribute. Keys are upper-cased; a repeated key replaces the old value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        upsert(&mut self.attributes, key, value.into());
        self
    }

    /// Attribute inside the `CONTEXT = [ ... ]` block.
    pub fn set_context(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        upsert(&mut self.context, key, value.into());
        self
    }

    /// Base64 cluster configuration. Line breaks and padding whitespace are stripped.
    pub fn set_cluster_config(&mut self, encoded: &str) -> &mut Self {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        self.set_context("CLUSTER_CFG", compact)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        lookup(&self.attributes, key)
    }

    pub fn render(&self) -> ClusterResult<String> {
        let key_re = Regex::new(ATTRIBUTE_KEY)
            .map_err(|e| ClusterError::Configuration(format!("attribute name pattern: {}", e)))?;
        let mut lines = Vec::with_capacity(self.attributes.len() + 1);
        for (key, value) in &self.attributes {
            check_key(&key_re, key)?;
            if key == "CONTEXT" {
                return Err(ClusterError::Configuration(
                    "CONTEXT is reserved; use context attributes instead".to_string(),
                ));
            }
            lines.push(format!("{} = \"{}\"", key, escape(value)));
        }
        if !self.context.is_empty() {
            let mut entries = Vec::with_capacity(self.context.len());
            for (key, value) in &self.context {
                check_key(&key_re, key)?;
                entries.push(format!("  {} = \"{}\"", key, escape(value)));
            }
            lines.push(format!("CONTEXT = [\n{} ]", entries.join(",\n")));
        }
        Ok(lines.join("\n"))
    }
}

fn upsert(entries: &mut Vec<(String, String)>, key: &str, value: String) {
    let key = key.trim().to_ascii_uppercase();
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}

fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    let key = key.to_ascii_uppercase();
    entries
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
}

fn check_key(key_re: &Regex, key: &str) -> ClusterResult<()> {
    if key_re.is_match(key) {
        Ok(())
    } else {
        Err(ClusterError::Configuration(format!(
            "invalid template attribute name {:?}",
            key
        )))
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
