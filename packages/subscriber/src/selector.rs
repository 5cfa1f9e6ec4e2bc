//! Method Selectors
//!
//! Derives ARC-4 method selectors and classifies the first application-call
//! argument of an observed transaction against the known operations.

use sha2::{Digest, Sha512_256};
use std::fmt;
use thiserror::Error;

/// Method name reported when no known operation matches
pub const UNKNOWN_METHOD: &str = "unknown";

/// Width of an ARC-4 method selector in bytes
pub const SELECTOR_LEN: usize = 4;

/// Errors that can occur while building selectors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("Invalid selector hex: {0}")]
    InvalidHex(String),

    #[error("Selector must be {SELECTOR_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("Malformed method signature: {0}")]
    MalformedSignature(String),
}

/// Fixed-width selector identifying a callable operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodSelector([u8; SELECTOR_LEN]);

impl MethodSelector {
    pub const fn new(bytes: [u8; SELECTOR_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SELECTOR_LEN] {
        &self.0
    }

    /// Lowercase hex without prefix (e.g. "f78f4f2d")
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a selector from hex, with or without a 0x prefix
    pub fn from_hex(value: &str) -> Result<Self, SelectorError> {
        let value = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(value).map_err(|e| SelectorError::InvalidHex(e.to_string()))?;
        let bytes: [u8; SELECTOR_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SelectorError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// Exact byte comparison against an observed argument
    pub fn matches(&self, arg: &[u8]) -> bool {
        arg == self.0.as_slice()
    }
}

impl fmt::Display for MethodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Derive the selector for a method from its name and type signature
///
/// # Arguments
/// * `name` - The method name (e.g. "turnOn")
/// * `arg_types` - ARC-4 argument types in declaration order
/// * `return_type` - ARC-4 return type ("void" for none)
pub fn selector_for(name: &str, arg_types: &[&str], return_type: &str) -> MethodSelector {
    let signature = format!("{}({}){}", name, arg_types.join(","), return_type);
    selector_for_signature(&signature)
}

/// Derive the selector for a full signature string such as "turnOn()void"
pub fn selector_for_signature(signature: &str) -> MethodSelector {
    let digest = Sha512_256::digest(signature.as_bytes());
    let mut bytes = [0u8; SELECTOR_LEN];
    bytes.copy_from_slice(&digest[..SELECTOR_LEN]);
    MethodSelector(bytes)
}

/// Parsed ARC-4 method signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub arg_types: Vec<String>,
    pub return_type: String,
}

impl MethodSignature {
    /// Parse "name(type,type,...)return", keeping tuple arguments intact
    pub fn parse(signature: &str) -> Result<Self, SelectorError> {
        let malformed = || SelectorError::MalformedSignature(signature.to_string());

        let open = signature.find('(').ok_or_else(malformed)?;
        let name = &signature[..open];
        if name.is_empty() {
            return Err(malformed());
        }

        let mut depth = 0usize;
        let mut close = None;
        for (offset, ch) in signature[open..].char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(open + offset);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(malformed)?;

        let return_type = &signature[close + 1..];
        if return_type.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            name: name.to_string(),
            arg_types: split_top_level(&signature[open + 1..close]),
            return_type: return_type.to_string(),
        })
    }

    pub fn selector(&self) -> MethodSelector {
        selector_for_signature(&self.to_string())
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}){}", self.name, self.arg_types.join(","), self.return_type)
    }
}

/// Split an argument list on commas that are not nested inside a tuple
fn split_top_level(args: &str) -> Vec<String> {
    if args.is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in args.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(args[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(args[start..].to_string());
    parts
}

/// The LED control operations exposed by the AlgoBlink application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedMethod {
    /// turnOn - 0xf78f4f2d
    TurnOn,
    /// turnOff - 0x31db4745
    TurnOff,
}

impl LedMethod {
    pub const ALL: [LedMethod; 2] = [LedMethod::TurnOn, LedMethod::TurnOff];

    /// Returns the selector the deployed application dispatches on
    pub fn selector(&self) -> MethodSelector {
        match self {
            LedMethod::TurnOn => MethodSelector::new([0xf7, 0x8f, 0x4f, 0x2d]),
            LedMethod::TurnOff => MethodSelector::new([0x31, 0xdb, 0x47, 0x45]),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedMethod::TurnOn => "turnOn",
            LedMethod::TurnOff => "turnOff",
        }
    }

    /// Returns the hex-encoded selector with 0x prefix
    pub fn hex(&self) -> &'static str {
        match self {
            LedMethod::TurnOn => "0xf78f4f2d",
            LedMethod::TurnOff => "0x31db4745",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Known method entry; the raw ASCII name is accepted as an alias since
    /// bare (non-ARC-4) calls pass the method name as argument 0
    pub fn known_method(&self) -> KnownMethod {
        KnownMethod::new(self.name(), self.selector()).with_alias(self.name().as_bytes())
    }
}

/// An operation the resolver can recognise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownMethod {
    pub name: String,
    pub selector: MethodSelector,
    pub aliases: Vec<Vec<u8>>,
}

impl KnownMethod {
    pub fn new(name: impl Into<String>, selector: MethodSelector) -> Self {
        Self {
            name: name.into(),
            selector,
            aliases: Vec::new(),
        }
    }

    /// Build from a full ARC-4 signature, deriving the selector
    pub fn from_signature(signature: &str) -> Result<Self, SelectorError> {
        let parsed = MethodSignature::parse(signature)?;
        let selector = parsed.selector();
        Ok(Self::new(parsed.name, selector))
    }

    pub fn with_alias(mut self, alias: impl Into<Vec<u8>>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// True if `arg` equals the selector or one of the aliases exactly
    pub fn matches(&self, arg: &[u8]) -> bool {
        self.selector.matches(arg) || self.aliases.iter().any(|alias| alias.as_slice() == arg)
    }
}

/// Classifies observed first arguments against a fixed table of operations
#[derive(Debug, Clone, Default)]
pub struct MethodResolver {
    methods: Vec<KnownMethod>,
}

impl MethodResolver {
    pub fn new(methods: Vec<KnownMethod>) -> Self {
        Self { methods }
    }

    /// Resolver for the LED control application
    pub fn led_control() -> Self {
        Self::new(LedMethod::ALL.iter().map(LedMethod::known_method).collect())
    }

    pub fn methods(&self) -> &[KnownMethod] {
        &self.methods
    }

    pub fn lookup(&self, name: &str) -> Option<&KnownMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Resolve the method name for an observed first argument
    ///
    /// # Returns
    /// The known method name, or [`UNKNOWN_METHOD`] if nothing matches exactly
    pub fn classify(&self, first_arg: &[u8]) -> &str {
        if first_arg.is_empty() {
            return UNKNOWN_METHOD;
        }
        self.methods
            .iter()
            .find(|m| m.matches(first_arg))
            .map(|m| m.name.as_str())
            .unwrap_or(UNKNOWN_METHOD)
    }

    /// Same as [`MethodResolver::classify`] for a hex-encoded argument
    pub fn classify_hex(&self, first_arg_hex: &str) -> &str {
        let value = first_arg_hex.strip_prefix("0x").unwrap_or(first_arg_hex);
        match hex::decode(value) {
            Ok(bytes) => self.classify(&bytes),
            Err(_) => UNKNOWN_METHOD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== selector derivation tests ====================

    #[test]
    fn test_selector_for_arc4_reference_vector() {
        // ARC-4 reference example
        let selector = selector_for("add", &["uint64", "uint64"], "uint128");
        assert_eq!(selector.hex(), "8aa3b61f");
    }

    #[test]
    fn test_selector_for_no_args() {
        assert_eq!(selector_for("turnOn", &[], "void").hex(), "d863a854");
        assert_eq!(selector_for("turnOff", &[], "void").hex(), "f29d9bf0");
    }

    #[test]
    fn test_selector_is_deterministic() {
        let a = selector_for("setLed", &["string"], "void");
        let b = selector_for_signature("setLed(string)void");
        assert_eq!(a, b);
        assert_eq!(a.hex(), "f5920582");
    }

    #[test]
    fn test_different_signatures_yield_different_selectors() {
        let a = selector_for("turnOn", &[], "void");
        let b = selector_for("turnOn", &[], "string");
        assert_ne!(a, b);
    }

    // ==================== MethodSelector tests ====================

    #[test]
    fn test_selector_from_hex_with_prefix() {
        let selector = MethodSelector::from_hex("0xf78f4f2d").unwrap();
        assert_eq!(selector, LedMethod::TurnOn.selector());
    }

    #[test]
    fn test_selector_from_hex_wrong_length() {
        let result = MethodSelector::from_hex("f78f4f");
        assert_eq!(result, Err(SelectorError::InvalidLength(3)));
    }

    #[test]
    fn test_selector_from_hex_invalid() {
        assert!(matches!(MethodSelector::from_hex("zzzzzzzz"), Err(SelectorError::InvalidHex(_))));
    }

    #[test]
    fn test_selector_display_is_hex() {
        assert_eq!(LedMethod::TurnOff.selector().to_string(), "31db4745");
    }

    // ==================== MethodSignature tests ====================

    #[test]
    fn test_parse_signature_simple() {
        let sig = MethodSignature::parse("add(uint64,uint64)uint128").unwrap();
        assert_eq!(sig.name, "add");
        assert_eq!(sig.arg_types, vec!["uint64", "uint64"]);
        assert_eq!(sig.return_type, "uint128");
    }

    #[test]
    fn test_parse_signature_with_tuple_argument() {
        let sig = MethodSignature::parse("swap((uint64,byte[]),string)void").unwrap();
        assert_eq!(sig.arg_types, vec!["(uint64,byte[])", "string"]);
        assert_eq!(sig.selector().hex(), "74a974a9");
    }

    #[test]
    fn test_parse_signature_round_trips_display() {
        let sig = MethodSignature::parse("turnOn()void").unwrap();
        assert!(sig.arg_types.is_empty());
        assert_eq!(sig.to_string(), "turnOn()void");
    }

    #[test]
    fn test_parse_signature_rejects_malformed() {
        assert!(MethodSignature::parse("turnOn").is_err());
        assert!(MethodSignature::parse("(uint64)void").is_err());
        assert!(MethodSignature::parse("turnOn(uint64").is_err());
        assert!(MethodSignature::parse("turnOn()").is_err());
    }

    // ==================== classify tests ====================

    #[test]
    fn test_classify_turn_on_selector() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify(&[0xf7, 0x8f, 0x4f, 0x2d]), "turnOn");
    }

    #[test]
    fn test_classify_turn_off_selector() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify(&[0x31, 0xdb, 0x47, 0x45]), "turnOff");
    }

    #[test]
    fn test_classify_raw_name_alias() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify(b"turnOn"), "turnOn");
        assert_eq!(resolver.classify(b"turnOff"), "turnOff");
    }

    #[test]
    fn test_classify_empty_is_unknown() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify(&[]), UNKNOWN_METHOD);
    }

    #[test]
    fn test_classify_strict_prefix_is_unknown() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify(&[0xf7, 0x8f, 0x4f]), UNKNOWN_METHOD);
        assert_eq!(resolver.classify(b"turnO"), UNKNOWN_METHOD);
    }

    #[test]
    fn test_classify_superstring_is_unknown() {
        // Substring containment must not match
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify(&[0xf7, 0x8f, 0x4f, 0x2d, 0x00]), UNKNOWN_METHOD);
        assert_eq!(resolver.classify(b"xturnOnx"), UNKNOWN_METHOD);
    }

    #[test]
    fn test_classify_unrelated_is_unknown() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify(&[0x12, 0x34, 0x56, 0x78]), UNKNOWN_METHOD);
    }

    #[test]
    fn test_classify_hex() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.classify_hex("f78f4f2d"), "turnOn");
        assert_eq!(resolver.classify_hex("0x31db4745"), "turnOff");
        assert_eq!(resolver.classify_hex("7475726e4f6e"), "turnOn");
        assert_eq!(resolver.classify_hex("not-hex"), UNKNOWN_METHOD);
    }

    #[test]
    fn test_classify_derived_signature() {
        let resolver = MethodResolver::new(vec![KnownMethod::from_signature("setLed(string)void").unwrap()]);
        assert_eq!(resolver.classify(&[0xf5, 0x92, 0x05, 0x82]), "setLed");
    }

    #[test]
    fn test_empty_resolver_classifies_everything_unknown() {
        let resolver = MethodResolver::default();
        assert_eq!(resolver.classify(&[0xf7, 0x8f, 0x4f, 0x2d]), UNKNOWN_METHOD);
    }

    // ==================== LedMethod tests ====================

    #[test]
    fn test_led_method_hex_matches_selector() {
        for method in LedMethod::ALL {
            assert_eq!(method.hex(), format!("0x{}", method.selector().hex()));
        }
    }

    #[test]
    fn test_led_method_from_name() {
        assert_eq!(LedMethod::from_name("turnOn"), Some(LedMethod::TurnOn));
        assert_eq!(LedMethod::from_name("turnOff"), Some(LedMethod::TurnOff));
        assert_eq!(LedMethod::from_name("toggle"), None);
    }

    #[test]
    fn test_resolver_lookup() {
        let resolver = MethodResolver::led_control();
        assert_eq!(resolver.lookup("turnOff").map(|m| m.selector), Some(LedMethod::TurnOff.selector()));
        assert!(resolver.lookup("toggle").is_none());
        assert_eq!(resolver.methods().len(), 2);
    }
}
