//! Chat-text tokenizer and validator for gamepad input sequences.
//!
//! Expanded chat text (macros already resolved by `core-macros`) is lexed
//! into a tree of chords and validated against a vocabulary, a blacklist, and
//! a handful of duration/port caps, in one fixed rule order. The same input
//! text, vocabulary, and caps always produce the same [`InputSequence`] —
//! the parser holds no state of its own and consults nothing but its
//! arguments, which is what makes that determinism possible to test.

use std::collections::HashMap;

/// Whether a raw duration number is measured in milliseconds or in frames
/// (converted to milliseconds downstream by the executor via `frame_ms`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Ms,
    Frames,
}

/// Parser-wide defaults. A subsequence with no explicit duration suffix uses
/// `default_duration`/`default_duration_unit`; `frame_ms` is only consulted
/// by callers converting `Frames` durations to wall-clock time.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub default_duration: u32,
    pub default_duration_unit: DurationUnit,
    pub frame_ms: u32,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            default_duration: 200,
            default_duration_unit: DurationUnit::Ms,
            frame_ms: 17,
        }
    }
}

/// The set of names the parser will accept as real inputs. `.` and `#` are
/// always recognized as the literal "wait" token regardless of vocabulary
/// contents, per the chat grammar.
#[derive(Debug, Clone, Default)]
pub struct InputVocabulary {
    buttons: std::collections::HashSet<String>,
    axes: std::collections::HashSet<String>,
}

impl InputVocabulary {
    pub fn new<B, A>(buttons: B, axes: A) -> Self
    where
        B: IntoIterator<Item = String>,
        A: IntoIterator<Item = String>,
    {
        Self {
            buttons: buttons.into_iter().map(|s| s.to_ascii_lowercase()).collect(),
            axes: axes.into_iter().map(|s| s.to_ascii_lowercase()).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        is_wait_token(name) || self.buttons.contains(name) || self.axes.contains(name)
    }

    pub fn is_axis(&self, name: &str) -> bool {
        self.axes.contains(name)
    }
}

fn is_wait_token(name: &str) -> bool {
    name == "." || name == "#"
}

/// One input within a chord: a button/axis/wait name plus its modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub name: String,
    /// Explicit `&p` override, 0-based internally (source text is 1-based).
    pub port: Option<usize>,
    pub duration_value: u32,
    pub duration_unit: DurationUnit,
    pub hold: bool,
    pub release: bool,
    /// Axis value 0-100, only meaningful when `name` is an axis.
    pub percent: Option<u8>,
}

/// A set of inputs pressed together (chord), separated from neighboring
/// subsequences by whitespace in the source text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputSubSequence {
    pub inputs: Vec<Input>,
}

impl InputSubSequence {
    /// The duration the executor sleeps for once every input in this chord
    /// has been pressed: the longest member duration, converted to ms.
    pub fn max_duration_ms(&self, cfg: &ParserConfig) -> u64 {
        self.inputs
            .iter()
            .map(|i| duration_to_ms(i.duration_value, i.duration_unit, cfg))
            .max()
            .unwrap_or(0)
    }
}

/// Converts a raw duration number to milliseconds, resolving `Frames` via
/// `cfg.frame_ms`. Exposed so the executor can convert durations it didn't
/// parse itself (e.g. a default duration baked into a macro body).
pub fn duration_to_ms(value: u32, unit: DurationUnit, cfg: &ParserConfig) -> u64 {
    match unit {
        DurationUnit::Ms => value as u64,
        DurationUnit::Frames => value as u64 * cfg.frame_ms as u64,
    }
}

/// Closed set of outcomes a chat message can resolve to. First matching rule
/// wins; see `validate` for the fixed evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    /// Message doesn't look like an input sequence at all; treat as chat.
    NormalMsg,
    Invalid,
    BlacklistedInput,
    ExceededMaxDuration,
    ExceededMaxSimultaneousDuration,
    InvalidPortNumber,
    InvalidInput,
}

/// A fully parsed (and validated) chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSequence {
    pub subsequences: Vec<InputSubSequence>,
    pub total_duration_ms: u64,
    pub outcome: ValidationOutcome,
}

impl InputSequence {
    pub fn is_valid(&self) -> bool {
        self.outcome == ValidationOutcome::Valid
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("input sequence rejected: {0:?}")]
pub struct ParseError(pub ValidationOutcome);

impl InputSequence {
    pub fn into_result(self) -> Result<InputSequence, ParseError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(ParseError(self.outcome))
        }
    }
}

/// Everything the parser needs beyond the raw text: what names exist, what's
/// off-limits to the issuer, and the caps it must enforce.
pub struct ParseContext<'a> {
    pub vocabulary: &'a InputVocabulary,
    pub config: &'a ParserConfig,
    pub port_count: usize,
    pub max_duration_ms: u64,
    pub max_simultaneous_duration_ms: u64,
    pub issuer_level: u8,
    /// Returns the minimum access level required to use `name`, or `None` if
    /// unrestricted.
    pub required_level: &'a dyn Fn(&str) -> Option<u8>,
}

/// Parse and validate `text`, always returning a structurally complete
/// `InputSequence` — failures are reported through `outcome`, never a panic
/// or `Err`. Use [`InputSequence::into_result`] to turn a non-`Valid`
/// outcome into an `Err`.
pub fn parse(text: &str, ctx: &ParseContext) -> InputSequence {
    let raw_steps: Vec<&str> = text.split_whitespace().collect();
    if raw_steps.is_empty() {
        return InputSequence {
            subsequences: Vec::new(),
            total_duration_ms: 0,
            outcome: ValidationOutcome::NormalMsg,
        };
    }

    let mut subsequences = Vec::with_capacity(raw_steps.len());
    for step in &raw_steps {
        match lex_step(step, ctx) {
            Some(sub) => subsequences.push(sub),
            None => {
                return InputSequence {
                    subsequences: Vec::new(),
                    total_duration_ms: 0,
                    outcome: ValidationOutcome::NormalMsg,
                };
            }
        }
    }

    let outcome = validate(&subsequences, ctx);
    let total_duration_ms = if outcome == ValidationOutcome::Valid {
        total_duration(&subsequences, ctx.config)
    } else {
        0
    };
    let subsequences = if outcome == ValidationOutcome::Valid {
        subsequences
    } else {
        Vec::new()
    };

    InputSequence {
        subsequences,
        total_duration_ms,
        outcome,
    }
}

/// Lex one whitespace-delimited step (a `+`-joined chord) into a subsequence,
/// or `None` if any member token isn't shaped like an input at all (the
/// whole message then falls back to `NormalMsg`).
fn lex_step(step: &str, ctx: &ParseContext) -> Option<InputSubSequence> {
    let mut inputs = Vec::new();
    for member in step.split('+') {
        if member.is_empty() {
            return None;
        }
        inputs.push(lex_token(member, ctx)?);
    }
    Some(InputSubSequence { inputs })
}

/// Lex a single chord member: `name (&port)? (digits)? (ms|s)? (digits%)? (_|-)?`.
fn lex_token(token: &str, ctx: &ParseContext) -> Option<Input> {
    let chars: Vec<char> = token.chars().collect();
    let mut pos = 0usize;

    let name = if chars[pos] == '.' || chars[pos] == '#' {
        pos += 1;
        chars[pos - 1].to_string()
    } else {
        let start = pos;
        // Names may contain letters, digits, and underscores (axis names like
        // `lstick_x`), which collides with the trailing hold flag `_`. Take the
        // maximal run and shrink from the right until it's a known name —
        // the same longest-match-then-backtrack shape as macro lookup.
        while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
            pos += 1;
        }
        if pos == start {
            return None;
        }
        let mut end = pos;
        loop {
            let candidate: String = chars[start..end].iter().collect::<String>().to_ascii_lowercase();
            if ctx.vocabulary.contains(&candidate) {
                pos = end;
                break candidate;
            }
            if end == start {
                return None;
            }
            end -= 1;
        }
    };

    let mut port = None;
    if pos < chars.len() && chars[pos] == '&' {
        pos += 1;
        let start = pos;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == start {
            return None;
        }
        let raw: u32 = chars[start..pos].iter().collect::<String>().parse().ok()?;
        // Source ports are 1-based; store 0-based. A raw value of 0 is kept
        // as an out-of-range sentinel so rule 5 catches it rather than
        // silently underflowing.
        port = Some(raw.saturating_sub(1) as usize);
        if raw == 0 {
            port = Some(usize::MAX);
        }
    }

    let mut duration_value = ctx.config.default_duration;
    let mut duration_unit = ctx.config.default_duration_unit;
    if pos < chars.len() && chars[pos].is_ascii_digit() {
        let start = pos;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
        duration_value = chars[start..pos].iter().collect::<String>().parse().ok()?;
        if chars[pos..].starts_with(&['m', 's']) {
            duration_unit = DurationUnit::Ms;
            pos += 2;
        } else if pos < chars.len() && chars[pos] == 's' {
            duration_unit = DurationUnit::Ms;
            duration_value = duration_value.saturating_mul(1000);
            pos += 1;
        }
    }

    let mut percent = None;
    if pos < chars.len() && chars[pos].is_ascii_digit() {
        let start = pos;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos < chars.len() && chars[pos] == '%' {
            let raw: u32 = chars[start..pos].iter().collect::<String>().parse().ok()?;
            percent = Some(raw);
            pos += 1;
        } else {
            return None;
        }
    }

    let mut hold = false;
    let mut release = false;
    if pos < chars.len() {
        match chars[pos] {
            '_' => {
                hold = true;
                pos += 1;
            }
            '-' => {
                release = true;
                pos += 1;
            }
            _ => return None,
        }
    }
    if pos != chars.len() {
        return None;
    }

    Some(Input {
        name,
        port,
        duration_value,
        duration_unit,
        hold,
        release,
        percent: percent.map(|p| p as u8),
    })
}

/// Applies the seven validation rules in their fixed order; the first rule
/// that fails determines the outcome.
fn validate(subsequences: &[InputSubSequence], ctx: &ParseContext) -> ValidationOutcome {
    for sub in subsequences {
        for input in &sub.inputs {
            if let Some(required) = (ctx.required_level)(&input.name) {
                if required > ctx.issuer_level {
                    return ValidationOutcome::BlacklistedInput;
                }
            }
        }
    }

    for sub in subsequences {
        for input in &sub.inputs {
            let ms = duration_to_ms(input.duration_value, input.duration_unit, ctx.config);
            if ms > ctx.max_duration_ms {
                return ValidationOutcome::ExceededMaxDuration;
            }
        }
    }

    let held_total: u64 = subsequences
        .iter()
        .flat_map(|s| s.inputs.iter())
        .filter(|i| i.hold)
        .map(|i| duration_to_ms(i.duration_value, i.duration_unit, ctx.config))
        .sum();
    if held_total > ctx.max_simultaneous_duration_ms {
        return ValidationOutcome::ExceededMaxSimultaneousDuration;
    }

    for sub in subsequences {
        for input in &sub.inputs {
            if let Some(port) = input.port {
                if port >= ctx.port_count {
                    return ValidationOutcome::InvalidPortNumber;
                }
            }
        }
    }

    for sub in subsequences {
        for input in &sub.inputs {
            if let Some(percent) = input.percent {
                if !ctx.vocabulary.is_axis(&input.name) || percent > 100 {
                    return ValidationOutcome::InvalidInput;
                }
            }
        }
    }

    ValidationOutcome::Valid
}

/// Sum of each subsequence's longest member duration. Holds that persist
/// into the next subsequence are not double-counted, but a hold's sleep
/// still contributes once at the step where it's pressed.
fn total_duration(subsequences: &[InputSubSequence], cfg: &ParserConfig) -> u64 {
    let mut total = 0u64;
    let mut carried_hold: HashMap<(String, Option<usize>), u64> = HashMap::new();
    for sub in subsequences {
        let mut step_max = 0u64;
        for input in &sub.inputs {
            let ms = duration_to_ms(input.duration_value, input.duration_unit, cfg);
            let key = (input.name.clone(), input.port);
            if input.release && carried_hold.remove(&key).is_some() {
                continue;
            }
            if input.hold {
                carried_hold.insert(key, ms);
            }
            step_max = step_max.max(ms);
        }
        total += step_max;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> InputVocabulary {
        InputVocabulary::new(
            ["a", "b", "start", "left", "right"].map(String::from),
            ["lstick_x"].map(String::from),
        )
    }

    fn ctx<'a>(vocabulary: &'a InputVocabulary, config: &'a ParserConfig) -> ParseContext<'a> {
        ParseContext {
            vocabulary,
            config,
            port_count: 2,
            max_duration_ms: 10_000,
            max_simultaneous_duration_ms: 10_000,
            issuer_level: 0,
            required_level: &|_| None,
        }
    }

    #[test]
    fn plain_chat_is_normal_msg() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("hello chat how's it going", &c);
        assert_eq!(result.outcome, ValidationOutcome::NormalMsg);
    }

    #[test]
    fn simple_button_is_valid() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
        assert_eq!(result.subsequences.len(), 1);
        assert_eq!(result.subsequences[0].inputs[0].name, "a");
        assert_eq!(result.subsequences[0].inputs[0].duration_value, 200);
    }

    #[test]
    fn explicit_duration_and_port() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a&2500ms", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
        let input = &result.subsequences[0].inputs[0];
        assert_eq!(input.port, Some(1));
        assert_eq!(input.duration_value, 500);
    }

    #[test]
    fn chord_with_plus() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a+b", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
        assert_eq!(result.subsequences[0].inputs.len(), 2);
    }

    #[test]
    fn hold_and_release_flags() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a_ a-", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
        assert!(result.subsequences[0].inputs[0].hold);
        assert!(result.subsequences[1].inputs[0].release);
    }

    #[test]
    fn axis_percent_valid() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("lstick_x75%", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
        assert_eq!(result.subsequences[0].inputs[0].percent, Some(75));
    }

    #[test]
    fn button_percent_is_invalid_input() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a50%", &c);
        assert_eq!(result.outcome, ValidationOutcome::InvalidInput);
    }

    #[test]
    fn axis_percent_over_100_is_invalid_input() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("lstick_x150%", &c);
        assert_eq!(result.outcome, ValidationOutcome::InvalidInput);
    }

    #[test]
    fn out_of_range_port_is_invalid_port_number() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a&5", &c);
        assert_eq!(result.outcome, ValidationOutcome::InvalidPortNumber);
    }

    #[test]
    fn port_zero_is_invalid_port_number() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a&0", &c);
        assert_eq!(result.outcome, ValidationOutcome::InvalidPortNumber);
    }

    #[test]
    fn duration_over_cap_is_exceeded_max_duration() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let mut c = ctx(&vocabulary, &config);
        c.max_duration_ms = 100;
        let result = parse("a5000ms", &c);
        assert_eq!(result.outcome, ValidationOutcome::ExceededMaxDuration);
    }

    #[test]
    fn blacklisted_input_above_level_is_rejected() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let mut c = ctx(&vocabulary, &config);
        c.required_level = &|name| if name == "start" { Some(5) } else { None };
        c.issuer_level = 0;
        let result = parse("start", &c);
        assert_eq!(result.outcome, ValidationOutcome::BlacklistedInput);
    }

    #[test]
    fn blacklisted_input_within_level_is_valid() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let mut c = ctx(&vocabulary, &config);
        c.required_level = &|name| if name == "start" { Some(5) } else { None };
        c.issuer_level = 10;
        let result = parse("start", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
    }

    #[test]
    fn wait_token_dot_is_valid_even_outside_vocabulary() {
        let vocabulary = InputVocabulary::new(Vec::<String>::new(), Vec::<String>::new());
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse(".300ms", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
        assert_eq!(result.subsequences[0].inputs[0].name, ".");
    }

    #[test]
    fn total_duration_sums_step_maxima() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let result = parse("a200ms .300ms b", &c);
        assert_eq!(result.outcome, ValidationOutcome::Valid);
        assert_eq!(result.total_duration_ms, 200 + 300 + 200);
    }

    #[test]
    fn same_input_twice_parses_identically() {
        let vocabulary = vocab();
        let config = ParserConfig::default();
        let c = ctx(&vocabulary, &config);
        let first = parse("a&2300ms_ + b-", &c);
        let second = parse("a&2300ms_ + b-", &c);
        assert_eq!(first, second);
    }

    proptest::proptest! {
        #[test]
        fn parse_is_deterministic(s in "[a-zA-Z&0-9%_+.# ]{0,40}") {
            let vocabulary = vocab();
            let config = ParserConfig::default();
            let c = ctx(&vocabulary, &config);
            let first = parse(&s, &c);
            let second = parse(&s, &c);
            prop_assert_eq!(first, second);
        }
    }
}
