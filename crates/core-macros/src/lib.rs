//! Macro store and macro expander (components C3/C4).
//!
//! A macro is a lowercase name registered under the sigil `#`. Invocation
//! inside a chat message is `#name` or, for *dynamic* macros, `#name(a,b,...)`
//! where each argument is itself a recursively-expandable fragment. The store
//! keeps an auxiliary trie over macro names (grounded on the same compressed
//! edge-list shape used for longest-prefix key-sequence matching elsewhere in
//! this codebase) so the expander can find the longest registered name at any
//! scan position without a linear map scan.

use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub const SIGIL: char = '#';
pub const DEFAULT_MAX_DEPTH: usize = 10;
const MAX_KEY_LEN: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacroStoreError {
    #[error("macro key must start with '{SIGIL}'")]
    MissingSigil,
    #[error("macro name must begin with an alphanumeric character")]
    EmptyName,
    #[error("macro key exceeds {MAX_KEY_LEN} characters")]
    KeyTooLong,
    #[error("malformed dynamic-arity pattern in macro key")]
    MalformedArityPattern,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpansionError {
    #[error("macro `{0}` expands into itself, directly or indirectly")]
    Cycle(String),
    #[error("expansion exceeded the maximum nesting depth")]
    DepthExceeded,
    #[error("macro `{name}` expects {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("no macro named `{0}` is registered")]
    UnknownMacro(String),
    #[error("malformed macro invocation near `{0}`")]
    MalformedInvocation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroDef {
    pub name: String,
    pub body: String,
    pub arity: Option<usize>,
}

impl MacroDef {
    /// Reconstructs the sigil-prefixed invocation key (`#name` or
    /// `#name(*,*,...)`), the inverse of `parse_key`. Used when a host needs
    /// to round-trip a definition back out to persisted storage.
    pub fn key(&self) -> String {
        match self.arity {
            None => format!("{SIGIL}{}", self.name),
            Some(arity) => {
                let placeholders = vec!["*"; arity].join(",");
                format!("{SIGIL}{}({placeholders})", self.name)
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Name trie
// -------------------------------------------------------------------------------------------------
// Compressed edge list per node, mirroring the teacher's compact-trie idiom: small fan-out at each
// level favors a SmallVec of (char, child-index) pairs over a full hashmap per node.

#[derive(Debug, Default)]
struct Node {
    edges: SmallVec<[(char, usize); 4]>,
    terminal: bool,
}

#[derive(Debug, Default)]
struct NameTrie {
    nodes: Vec<Node>,
}

impl NameTrie {
    fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    fn insert(&mut self, name: &str) {
        let mut cur = 0usize;
        for ch in name.chars() {
            cur = match self.nodes[cur].edges.iter().find(|(c, _)| *c == ch) {
                Some((_, next)) => *next,
                None => {
                    let new_idx = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[cur].edges.push((ch, new_idx));
                    new_idx
                }
            };
        }
        self.nodes[cur].terminal = true;
    }

    fn remove(&mut self, name: &str) {
        // Rebuilt lazily: just clear the terminal flag. Orphaned interior nodes are
        // harmless (they never resolve without a terminal marker).
        let mut cur = 0usize;
        for ch in name.chars() {
            match self.nodes[cur].edges.iter().find(|(c, _)| *c == ch) {
                Some((_, next)) => cur = *next,
                None => return,
            }
        }
        self.nodes[cur].terminal = false;
    }

    /// Longest registered name that is a prefix of `text`. Returns the matched length in bytes.
    fn longest_prefix(&self, text: &str) -> Option<usize> {
        let mut cur = 0usize;
        let mut best: Option<usize> = None;
        let mut consumed = 0usize;
        for ch in text.chars() {
            match self.nodes[cur].edges.iter().find(|(c, _)| *c == ch) {
                Some((_, next)) => {
                    cur = *next;
                    consumed += ch.len_utf8();
                    if self.nodes[cur].terminal {
                        best = Some(consumed);
                    }
                }
                None => break,
            }
        }
        best
    }
}

/// Parsed pieces of a macro key: the bare lowercase name and, for dynamic macros, the declared
/// arity encoded by the number of `*` placeholders inside the parenthesized pattern.
fn parse_key(key: &str) -> Result<(String, Option<usize>), MacroStoreError> {
    if key.len() > MAX_KEY_LEN {
        return Err(MacroStoreError::KeyTooLong);
    }
    let rest = key.strip_prefix(SIGIL).ok_or(MacroStoreError::MissingSigil)?;
    if rest.is_empty() || !rest.chars().next().unwrap().is_alphanumeric() {
        return Err(MacroStoreError::EmptyName);
    }
    match rest.find('(') {
        None => Ok((rest.to_ascii_lowercase(), None)),
        Some(paren_idx) => {
            let name = rest[..paren_idx].to_ascii_lowercase();
            let params = rest[paren_idx..]
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or(MacroStoreError::MalformedArityPattern)?;
            if params.is_empty() {
                return Err(MacroStoreError::MalformedArityPattern);
            }
            let arity = params.split(',').count();
            if !params.split(',').all(|p| p.trim() == "*") {
                return Err(MacroStoreError::MalformedArityPattern);
            }
            Ok((name, Some(arity)))
        }
    }
}

/// CRUD store over macro definitions plus the longest-prefix name trie (§4.3). A persistence
/// callback supplied by the host is invoked after every mutating operation; it is infallible from
/// this crate's point of view — the host owns error surfacing/retry for its own storage medium.
pub struct MacroStore {
    defs: HashMap<String, MacroDef>,
    trie: NameTrie,
    on_change: Option<Box<dyn FnMut(&MacroStore) + Send>>,
}

impl Default for MacroStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroStore {
    pub fn new() -> Self {
        Self {
            defs: HashMap::new(),
            trie: NameTrie::new(),
            on_change: None,
        }
    }

    pub fn with_persistence<F>(on_change: F) -> Self
    where
        F: FnMut(&MacroStore) + Send + 'static,
    {
        Self {
            defs: HashMap::new(),
            trie: NameTrie::new(),
            on_change: Some(Box::new(on_change)),
        }
    }

    pub fn insert(&mut self, key: &str, body: &str) -> Result<(), MacroStoreError> {
        let (name, arity) = parse_key(key)?;
        self.trie.insert(&name);
        self.defs.insert(
            name.clone(),
            MacroDef {
                name,
                body: body.to_string(),
                arity,
            },
        );
        self.notify();
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<MacroDef> {
        let name = key.strip_prefix(SIGIL).unwrap_or(key).to_ascii_lowercase();
        let base = name.split('(').next().unwrap_or(&name).to_string();
        let removed = self.defs.remove(&base);
        if removed.is_some() {
            self.trie.remove(&base);
            self.notify();
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&MacroDef> {
        self.defs.get(name)
    }

    pub fn is_dynamic(&self, name: &str) -> Option<usize> {
        self.defs.get(name).and_then(|d| d.arity)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Iterates every registered definition, for a host to snapshot the whole store (e.g. to
    /// persist it) without reaching into private fields.
    pub fn iter(&self) -> impl Iterator<Item = &MacroDef> {
        self.defs.values()
    }

    /// Longest registered macro name that prefixes `text` (which must NOT include the sigil).
    fn longest_match(&self, text: &str) -> Option<&str> {
        self.trie.longest_prefix(text).map(|len| &text[..len])
    }

    fn notify(&mut self) {
        if let Some(mut cb) = self.on_change.take() {
            cb(self);
            self.on_change = Some(cb);
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Macro expander
// -------------------------------------------------------------------------------------------------

pub struct MacroExpander {
    max_depth: usize,
}

impl Default for MacroExpander {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl MacroExpander {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn expand(&self, input: &str, store: &MacroStore) -> Result<String, ExpansionError> {
        let mut in_progress = HashSet::new();
        self.expand_at_depth(input, store, 0, &mut in_progress)
    }

    fn expand_at_depth(
        &self,
        input: &str,
        store: &MacroStore,
        depth: usize,
        in_progress: &mut HashSet<String>,
    ) -> Result<String, ExpansionError> {
        if depth > self.max_depth {
            return Err(ExpansionError::DepthExceeded);
        }

        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(sigil_idx) = rest.find(SIGIL) {
            out.push_str(&rest[..sigil_idx]);
            let after_sigil = &rest[sigil_idx + SIGIL.len_utf8()..];

            let Some(name) = store.longest_match(after_sigil) else {
                let attempted = take_identifier(after_sigil);
                if attempted.is_empty() {
                    out.push(SIGIL);
                    rest = after_sigil;
                    continue;
                }
                return Err(ExpansionError::UnknownMacro(attempted.to_string()));
            };
            let name = name.to_string();
            let after_name = &after_sigil[name.len()..];

            if in_progress.contains(&name) {
                return Err(ExpansionError::Cycle(name));
            }

            let def = store
                .get(&name)
                .expect("trie match implies a registered definition")
                .clone();

            let (consumed_after_name, body_source) = if let Some(expected) = def.arity {
                let (args_src, consumed) = take_paren_group(after_name)
                    .ok_or_else(|| ExpansionError::MalformedInvocation(name.clone()))?;
                let raw_args = split_top_level_commas(args_src);
                if raw_args.len() != expected {
                    return Err(ExpansionError::ArityMismatch {
                        name: name.clone(),
                        expected,
                        got: raw_args.len(),
                    });
                }
                let mut expanded_args = Vec::with_capacity(raw_args.len());
                for arg in raw_args {
                    expanded_args.push(self.expand_at_depth(arg, store, depth + 1, in_progress)?);
                }
                (consumed, substitute_placeholders(&def.body, &expanded_args))
            } else {
                (0, def.body.clone())
            };

            in_progress.insert(name.clone());
            let expanded_body =
                self.expand_at_depth(&body_source, store, depth + 1, in_progress)?;
            in_progress.remove(&name);

            out.push_str(&expanded_body);
            rest = &after_name[consumed_after_name..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn take_identifier(text: &str) -> &str {
    let end = text
        .char_indices()
        .find(|(_, c)| !c.is_alphanumeric())
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

/// Consumes a `(...)` group starting at byte 0 of `text`, respecting nesting so that arguments
/// which themselves contain parenthesized macro calls are not split early. Returns the inner
/// content and the number of bytes consumed (including both parens).
fn take_paren_group(text: &str) -> Option<(&str, usize)> {
    let mut chars = text.char_indices();
    let (_, first) = chars.next()?;
    if first != '(' {
        return None;
    }
    let mut depth = 1usize;
    for (idx, ch) in chars {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&text[1..idx], idx + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level_commas(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out
}

fn substitute_placeholders(body: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(open) = rest.find('<') {
        let Some(close_rel) = rest[open..].find('>') else {
            out.push_str(rest);
            return out;
        };
        let close = open + close_rel;
        let inner = &rest[open + 1..close];
        match inner.parse::<usize>() {
            Ok(idx) if idx < args.len() => {
                out.push_str(&rest[..open]);
                out.push_str(&args[idx]);
            }
            _ => {
                out.push_str(&rest[..=close]);
            }
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_key_without_sigil() {
        let mut store = MacroStore::new();
        assert_eq!(
            store.insert("smash", "a b").unwrap_err(),
            MacroStoreError::MissingSigil
        );
    }

    #[test]
    fn inserts_and_expands_simple_macro() {
        let mut store = MacroStore::new();
        store.insert("#combo", "a b c").unwrap();
        let expander = MacroExpander::default();
        assert_eq!(expander.expand("#combo", &store).unwrap(), "a b c");
    }

    #[test]
    fn dynamic_macro_substitutes_positional_args() {
        let mut store = MacroStore::new();
        store.insert("#smash(*,*)", "<0> <1> <0>").unwrap();
        assert_eq!(store.is_dynamic("smash"), Some(2));
        let expander = MacroExpander::default();
        let out = expander.expand("#smash(left,right)", &store).unwrap();
        assert_eq!(out, "left right left");
    }

    #[test]
    fn dynamic_macro_arity_mismatch_errors() {
        let mut store = MacroStore::new();
        store.insert("#smash(*,*)", "<0> <1>").unwrap();
        let expander = MacroExpander::default();
        let err = expander.expand("#smash(left)", &store).unwrap_err();
        assert!(matches!(
            err,
            ExpansionError::ArityMismatch {
                expected: 2,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn unknown_macro_errors() {
        let store = MacroStore::new();
        let expander = MacroExpander::default();
        let err = expander.expand("#nope", &store).unwrap_err();
        assert_eq!(err, ExpansionError::UnknownMacro("nope".to_string()));
    }

    #[test]
    fn self_referential_macro_is_a_cycle() {
        let mut store = MacroStore::new();
        store.insert("#loop", "#loop").unwrap();
        let expander = MacroExpander::default();
        let err = expander.expand("#loop", &store).unwrap_err();
        assert_eq!(err, ExpansionError::Cycle("loop".to_string()));
    }

    #[test]
    fn indirect_cycle_is_detected() {
        let mut store = MacroStore::new();
        store.insert("#a", "#b").unwrap();
        store.insert("#b", "#a").unwrap();
        let expander = MacroExpander::default();
        let err = expander.expand("#a", &store).unwrap_err();
        assert!(matches!(err, ExpansionError::Cycle(_)));
    }

    #[test]
    fn nested_dynamic_macro_arguments_expand_first() {
        let mut store = MacroStore::new();
        store.insert("#inner(*)", "[<0>]").unwrap();
        store.insert("#outer(*)", "<0>!").unwrap();
        let expander = MacroExpander::default();
        let out = expander.expand("#outer(#inner(x))", &store).unwrap();
        assert_eq!(out, "[x]!");
    }

    #[test]
    fn longest_prefix_chooses_longer_registered_name() {
        let mut store = MacroStore::new();
        store.insert("#a", "short").unwrap();
        store.insert("#ab", "long").unwrap();
        let expander = MacroExpander::default();
        assert_eq!(expander.expand("#ab", &store).unwrap(), "long");
        assert_eq!(expander.expand("#a", &store).unwrap(), "short");
    }

    #[test]
    fn removed_macro_is_no_longer_matched() {
        let mut store = MacroStore::new();
        store.insert("#gone", "x").unwrap();
        store.remove("#gone");
        let expander = MacroExpander::default();
        assert_eq!(
            expander.expand("#gone", &store).unwrap_err(),
            ExpansionError::UnknownMacro("gone".to_string())
        );
    }

    #[test]
    fn depth_exceeded_on_long_chain() {
        let mut store = MacroStore::new();
        for i in 0..20 {
            store
                .insert(&format!("#m{i}"), &format!("#m{}", i + 1))
                .unwrap();
        }
        store.insert("#m20", "done").unwrap();
        let expander = MacroExpander::new(5);
        let err = expander.expand("#m0", &store).unwrap_err();
        assert_eq!(err, ExpansionError::DepthExceeded);
    }

    #[test]
    fn def_key_round_trips_through_parse_key() {
        let mut store = MacroStore::new();
        store.insert("#smash(*,*)", "<0> <1>").unwrap();
        store.insert("#combo", "a b c").unwrap();
        let keys: HashSet<_> = store.iter().map(MacroDef::key).collect();
        assert!(keys.contains("#smash(*,*)"));
        assert!(keys.contains("#combo"));
    }

    #[test]
    fn persistence_callback_invoked_on_mutation() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut store = MacroStore::with_persistence(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        store.insert("#x", "y").unwrap();
        store.remove("#x");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
