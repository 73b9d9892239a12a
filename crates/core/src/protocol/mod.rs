//! Textual command codec.
//!
//! Events travel to the engine as flat `key/value/key/value` paths terminated
//! by a single zero byte. The engine tokenizer ignores empty tokens, so a
//! leading or trailing `/` is optional on the wire.

use std::borrow::Cow;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Synthesis sources the engine renders without sample data.
const BUILTIN_SOURCES: &[&str] = &[
    "triangle", "tri", "sine", "sawtooth", "saw", "zawtooth", "zaw", "pulse", "square", "pulze",
    "zquare", "add", "white", "pink", "brown", "kick", "snare", "sd", "hat", "hh", "hihat", "tom",
    "rim", "rimshot", "rs", "cowbell", "cb", "cymbal", "crash", "cy", "sample", "wt",
    "websample", "live", "livein", "mic", "plmodal", "modal", "plva", "va", "analog", "plws",
    "ws", "waveshape", "plfm", "fm2", "plgrain", "grain", "pladd", "additive", "plwt",
    "wavetable", "plchord", "chord", "plswarm", "swarm", "plnoise", "pnoise",
];

/// Returns `true` if `name` is one of the engine's built-in synthesis sources.
pub fn is_builtin_source(name: &str) -> bool {
    BUILTIN_SOURCES.contains(&name)
}

/// A single event value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    /// Key present without a payload.
    Flag,
}

impl Value {
    /// Wire representation of the value. Flags have none.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Text(text) => Some(Cow::Borrowed(text)),
            Value::Number(number) => Some(Cow::Owned(number.to_string())),
            Value::Flag => None,
        }
    }

    /// Numeric view, parsing text values when needed.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            Value::Text(text) => text.trim().parse().ok(),
            Value::Flag => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Text(text) => serializer.serialize_str(text),
            Value::Number(number) => serializer.serialize_f64(*number),
            Value::Flag => serializer.serialize_none(),
        }
    }
}

/// Ordered key/value mapping describing one command.
///
/// Keys are unique. Re-inserting a key replaces its value in place so the
/// encoded order stays deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    entries: Vec<(String, Value)>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sound name as written by the caller (`s` or `sound`).
    pub fn sound(&self) -> Option<&str> {
        self.get_str("s").or_else(|| self.get_str("sound"))
    }

    /// Sample index within the bank (`n`), truncated towards zero.
    pub fn sound_index(&self) -> usize {
        self.get_number("n")
            .filter(|n| n.is_finite() && *n > 0.0)
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    /// Bank-qualified sound name: `{s}_{bank}` when a bank is given.
    pub fn bank_sound(&self) -> Option<String> {
        let sound = self.sound()?;
        Some(match self.get_str("bank") {
            Some(bank) => format!("{sound}_{bank}"),
            None => sound.to_string(),
        })
    }

    /// Copy of the event with every number replaced by its wire text, which
    /// is exactly what [`parse_path`] produces for it.
    pub fn to_wire_form(&self) -> Event {
        let entries = self
            .entries
            .iter()
            .map(|(k, v)| {
                let value = match v.as_text() {
                    Some(text) => Value::Text(text.into_owned()),
                    None => Value::Flag,
                };
                (k.clone(), value)
            })
            .collect();
        Event { entries }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Event {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut event = Event::new();
        for (key, value) in iter {
            event.insert(key, value);
        }
        event
    }
}

/// Zero-terminated UTF-8 command ready for the engine's event-input region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    bytes: Vec<u8>,
}

impl EncodedCommand {
    /// Wraps raw path text, appending the terminator.
    pub fn from_path(path: &str) -> Self {
        let mut bytes = Vec::with_capacity(path.len() + 1);
        bytes.extend_from_slice(path.as_bytes());
        bytes.push(0);
        Self { bytes }
    }

    /// Full byte sequence including the trailing zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Path text without the terminator.
    pub fn as_str(&self) -> &str {
        let text = &self.bytes[..self.bytes.len() - 1];
        // Only ever built from a `&str`.
        std::str::from_utf8(text).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 1
    }
}

impl fmt::Display for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializes an event as `key1/value1/key2/value2` followed by a zero byte.
///
/// Valued entries keep their insertion order. Flags carry no value, so they
/// are written last as bare keys; anywhere else they would shift every later
/// pair.
pub fn encode_path(event: &Event) -> EncodedCommand {
    let mut tokens: Vec<Cow<'_, str>> = Vec::with_capacity(event.len() * 2);
    let mut flags = Vec::new();
    for (key, value) in event.iter() {
        match value.as_text() {
            Some(text) => {
                tokens.push(Cow::Borrowed(key));
                tokens.push(text);
            }
            None => flags.push(key),
        }
    }
    tokens.extend(flags.into_iter().map(Cow::Borrowed));
    EncodedCommand::from_path(&tokens.join("/"))
}

/// Parses a path back into an event.
///
/// `//` starts a comment that runs to the end of its line. Lines are joined
/// into one token stream, empty tokens are dropped and consecutive tokens are
/// paired. A trailing key without a value becomes [`Value::Flag`].
pub fn parse_path(text: &str) -> Event {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let code = match line.find("//") {
            Some(index) => &line[..index],
            None => line,
        };
        tokens.extend(
            code.split('/')
                .map(str::trim)
                .filter(|token| !token.is_empty()),
        );
    }

    let mut event = Event::new();
    for pair in tokens.chunks(2) {
        match pair {
            [key, value] => event.insert(*key, *value),
            [key] => event.insert(*key, Value::Flag),
            _ => {}
        }
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_numbers_in_shortest_decimal_form() {
        let event = Event::new().with("freq", 440.0).with("lpf", 800.0);
        let encoded = encode_path(&event);

        assert_eq!(encoded.as_bytes(), b"freq/440/lpf/800\0");
        assert_eq!(encoded.as_str(), "freq/440/lpf/800");

        let fractional = Event::new().with("gain", 0.25).with("pan", -1.5);
        assert_eq!(encode_path(&fractional).as_str(), "gain/0.25/pan/-1.5");
    }

    #[test]
    fn parses_leading_slash_paths_into_text_values() {
        let event = parse_path("/freq/440/lpf/800");

        assert_eq!(event.len(), 2);
        assert_eq!(event.get("freq"), Some(&Value::Text("440".into())));
        assert_eq!(event.get_number("lpf"), Some(800.0));
    }

    #[test]
    fn decoded_paths_match_the_wire_form_of_the_source_event() {
        let event = Event::new()
            .with("s", "kick")
            .with("n", 3usize)
            .with("gain", 0.8)
            .with("orbit", 1i64);

        let parsed = parse_path(encode_path(&event).as_str());
        assert_eq!(parsed, event.to_wire_form());
    }

    #[test]
    fn trailing_key_becomes_a_flag() {
        let event = parse_path("/s/sine/reset");

        assert_eq!(event.get("reset"), Some(&Value::Flag));
        assert_eq!(event.get_number("reset"), None);
        assert_eq!(encode_path(&event).as_str(), "s/sine/reset");
    }

    #[test]
    fn strips_line_comments_and_joins_lines() {
        let event = parse_path(
            "/s/saw // the source\n\
             /freq/220\n\
             \n\
             // a whole commented line\n\
             /lpf/1200/",
        );

        let keys: Vec<&str> = event.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["s", "freq", "lpf"]);
        assert_eq!(event.get_str("s"), Some("saw"));
    }

    #[test]
    fn flags_are_written_after_valued_entries() {
        let mut event = parse_path("/s/bd/legato");
        event.insert("file_pcm", 0usize);
        event.insert("file_frames", 64usize);

        let encoded = encode_path(&event);
        assert_eq!(encoded.as_str(), "s/bd/file_pcm/0/file_frames/64/legato");

        let parsed = parse_path(encoded.as_str());
        assert_eq!(parsed.get_number("file_pcm"), Some(0.0));
        assert_eq!(parsed.get_number("file_frames"), Some(64.0));
        assert_eq!(parsed.get("legato"), Some(&Value::Flag));
    }

    #[test]
    fn reinsert_keeps_original_position() {
        let mut event = Event::new().with("a", 1.0).with("b", 2.0);
        event.insert("a", 3.0);

        assert_eq!(encode_path(&event).as_str(), "a/3/b/2");
    }

    #[test]
    fn bank_qualifies_the_sound_name() {
        let event = parse_path("/s/bd/bank/tr909/n/2.7");

        assert_eq!(event.sound(), Some("bd"));
        assert_eq!(event.bank_sound().as_deref(), Some("bd_tr909"));
        assert_eq!(event.sound_index(), 2);
    }

    #[test]
    fn builtin_sources_are_recognised() {
        assert!(is_builtin_source("sine"));
        assert!(is_builtin_source("plmodal"));
        assert!(!is_builtin_source("casio"));
    }

    #[test]
    fn serializes_as_an_ordered_json_object() {
        let event = parse_path("/s/sine/freq/440/legato");
        let json = serde_json::to_string(&event).unwrap();

        assert_eq!(json, r#"{"s":"sine","freq":"440","legato":null}"#);
    }
}
