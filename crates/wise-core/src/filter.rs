//! Allow/deny lists
//!
//! IP indicators are matched against a binary prefix trie built from CIDRs.
//! Every other type is matched against wildcard patterns compiled into a
//! single anchored, case-insensitive `RegexSet`.

use ipnetwork::IpNetwork;
use regex::RegexSet;
use std::net::IpAddr;
use thiserror::Error;
use wise_common::IndicatorType;

/// Filter construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// Entry is not an address or CIDR
    #[error("bad CIDR {0:?}: {1}")]
    BadCidr(String, String),

    /// Pattern did not compile
    #[error("bad wildcard pattern: {0}")]
    BadPattern(String),
}

#[derive(Debug, Default, Clone)]
struct TrieNode {
    children: [Option<u32>; 2],
    terminal: bool,
}

/// Binary trie over address bits with separate v4 and v6 roots
#[derive(Debug, Clone)]
pub struct IpTrie {
    nodes: Vec<TrieNode>,
    len: usize,
}

const V4_ROOT: usize = 0;
const V6_ROOT: usize = 1;

impl IpTrie {
    /// Create empty trie
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default(), TrieNode::default()],
            len: 0,
        }
    }

    /// Add a network
    pub fn insert(&mut self, network: IpNetwork) {
        let (root, bits) = key_bits(network.ip());
        let mut node = root;
        for i in 0..network.prefix() as usize {
            let bit = bit_at(bits, i);
            node = match self.nodes[node].children[bit] {
                Some(next) => next as usize,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children[bit] = Some(next as u32);
                    next
                }
            };
        }
        if !self.nodes[node].terminal {
            self.nodes[node].terminal = true;
            self.len += 1;
        }
    }

    /// Parse and add `addr` or `addr/prefix`
    pub fn insert_str(&mut self, entry: &str) -> Result<(), FilterError> {
        let network: IpNetwork = entry
            .trim()
            .parse()
            .map_err(|e: ipnetwork::IpNetworkError| {
                FilterError::BadCidr(entry.to_string(), e.to_string())
            })?;
        self.insert(network);
        Ok(())
    }

    /// Prefix length of the most specific network containing `ip`
    pub fn longest_match(&self, ip: IpAddr) -> Option<u8> {
        let (root, bits) = key_bits(ip);
        let width = if ip.is_ipv4() { 32 } else { 128 };
        let mut node = root;
        let mut best = self.nodes[node].terminal.then_some(0u8);
        for i in 0..width {
            match self.nodes[node].children[bit_at(bits, i)] {
                Some(next) => node = next as usize,
                None => break,
            }
            if self.nodes[node].terminal {
                best = Some(i as u8 + 1);
            }
        }
        best
    }

    /// True if any network contains `ip`
    #[inline]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.longest_match(ip).is_some()
    }

    /// Number of distinct networks
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for IpTrie {
    fn default() -> Self {
        Self::new()
    }
}

/// v4 keys sit in the top 32 bits so bit 0 is always the first address bit
fn key_bits(ip: IpAddr) -> (usize, u128) {
    match ip {
        IpAddr::V4(v4) => (V4_ROOT, (u32::from(v4) as u128) << 96),
        IpAddr::V6(v6) => (V6_ROOT, u128::from(v6)),
    }
}

#[inline]
fn bit_at(bits: u128, i: usize) -> usize {
    ((bits >> (127 - i)) & 1) as usize
}

/// Translate a wildcard expression into an anchored regex.
///
/// `*` and `%` match any run, `?` and `_` one char, `#` one digit,
/// `[!..]` is a negated class, `~c` is a literal `c`, `<` and `>` are word
/// boundaries. Brackets and parentheses pass through. Braces pass through
/// only as a `{n}`, `{n,}` or `{n,m}` repeat and are literal otherwise.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?i)^(?:");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' | '%' => out.push_str(".*"),
            '?' | '_' => out.push('.'),
            '#' => out.push_str("\\d"),
            '<' | '>' => out.push_str("\\b"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
            }
            '{' => match repeat_count(chars.clone()) {
                Some(body) => {
                    out.push('{');
                    out.push_str(&body);
                    for _ in 0..body.len() {
                        chars.next();
                    }
                }
                None => out.push_str("\\{"),
            },
            ']' | '(' | ')' | ',' => out.push(c),
            '~' => match chars.next() {
                Some(lit) => out.push_str(&regex::escape(&lit.to_string())),
                None => out.push('~'),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push_str(")$");
    out
}

/// Text after a `{` up to and including `}` when it reads `\d+,?\d*}`
fn repeat_count(rest: impl Iterator<Item = char>) -> Option<String> {
    let mut body = String::new();
    let mut comma = false;
    for c in rest {
        match c {
            '0'..='9' => body.push(c),
            ',' if !comma && !body.is_empty() => {
                comma = true;
                body.push(c);
            }
            '}' if !body.is_empty() => {
                body.push(c);
                return Some(body);
            }
            _ => return None,
        }
    }
    None
}

/// One type's list
#[derive(Debug, Clone)]
pub enum Matcher {
    /// CIDRs
    Ip(IpTrie),
    /// Wildcards
    Pattern(RegexSet),
}

impl Matcher {
    /// Build the matcher appropriate for `itype` from config entries.
    ///
    /// Blank entries are ignored.
    pub fn build<S: AsRef<str>>(itype: IndicatorType, entries: &[S]) -> Result<Self, FilterError> {
        let entries = entries
            .iter()
            .map(|e| e.as_ref().trim())
            .filter(|e| !e.is_empty());

        if itype == IndicatorType::Ip {
            let mut trie = IpTrie::new();
            for entry in entries {
                trie.insert_str(entry)?;
            }
            Ok(Matcher::Ip(trie))
        } else {
            let set = RegexSet::new(entries.map(wildcard_to_regex))
                .map_err(|e| FilterError::BadPattern(e.to_string()))?;
            Ok(Matcher::Pattern(set))
        }
    }

    /// True if `value` is on the list. Unparseable IPs never match.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Ip(trie) => value
                .parse::<IpAddr>()
                .map(|ip| trie.contains(ip))
                .unwrap_or(false),
            Matcher::Pattern(set) => set.is_match(value),
        }
    }

    /// True if the list has no entries
    pub fn is_empty(&self) -> bool {
        match self {
            Matcher::Ip(trie) => trie.is_empty(),
            Matcher::Pattern(set) => set.is_empty(),
        }
    }
}

/// Per-type lists, one slot per indicator type
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    slots: [Option<Matcher>; IndicatorType::COUNT],
}

impl FilterSet {
    /// Create with no lists
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the list for `itype`, replacing any previous one.
    /// An empty list clears the slot.
    pub fn set<S: AsRef<str>>(
        &mut self,
        itype: IndicatorType,
        entries: &[S],
    ) -> Result<(), FilterError> {
        let matcher = Matcher::build(itype, entries)?;
        self.slots[itype.index()] = (!matcher.is_empty()).then_some(matcher);
        Ok(())
    }

    /// List for `itype`, if any
    pub fn get(&self, itype: IndicatorType) -> Option<&Matcher> {
        self.slots[itype.index()].as_ref()
    }

    /// True if a list exists for `itype` and contains `value`
    pub fn matches(&self, itype: IndicatorType, value: &str) -> bool {
        self.get(itype).map(|m| m.matches(value)).unwrap_or(false)
    }
}
