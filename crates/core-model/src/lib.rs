//! Event adapter (C8): wires an inbound chat message through user lookup,
//! the meme map, macro expansion, parsing, and dispatch to the executor.
//!
//! `Application` owns every sub-component by value and exposes a single
//! entry point, `handle_message`, so `bot-bin`'s tick loop has one call to
//! make per `MessageReceived` event. It deliberately does not own the chat
//! transport or the tick timing itself — those stay in `bot-bin` — only the
//! pure translation from raw text to HID dispatch plus whatever outbound
//! chat lines that translation produces along the way.

use std::collections::HashMap;
use std::sync::Arc;

use core_actions::{ExecutionRequest, Executor};
use core_config::{PersistenceBackend, Settings};
use core_hid::VirtualHidBackend;
use core_input::{InputVocabulary, ParseContext, ParserConfig, ValidationOutcome};
use core_macros::{ExpansionError, MacroExpander, MacroStore};
use core_routines::OutboundQueue;
use core_state::{AccessLevel, Blacklist, UserStore};

/// Minimum access level required to mutate the macro store or to flip every
/// cancellation flag with `/stopall`. Not named by the spec (§9-style open
/// question, resolved here): these are the only two mutations that affect
/// every user rather than just the issuer, so they're gated like any other
/// privileged action in this codebase rather than left open to anyone.
pub const PRIVILEGED_COMMAND_LEVEL: AccessLevel = AccessLevel::Moderator;

/// What happened to one inbound chat message, for logging and tests. Not
/// sent anywhere itself — outbound chat replies, if any, are already queued
/// on `OutboundQueue` by the time this is returned.
#[derive(Debug, PartialEq, Eq)]
pub enum AdapterOutcome {
    /// Hit the meme map; a reply was enqueued.
    MemeReply,
    /// Didn't look like an input sequence at all.
    NormalMessage,
    /// Macro expansion failed before parsing ever ran.
    ExpansionFailed(ExpansionError),
    /// Parsed but rejected for a reason other than "not an input".
    Rejected(ValidationOutcome),
    /// Valid but the issuer's assigned port isn't usable right now.
    PortUnavailable { port: usize },
    /// Handed off to the executor.
    Dispatched { port: usize },
    /// `/stopall` flipped every in-flight cancellation flag.
    StoppedAll,
    /// `{sigil}addmacro #name expansion` registered a macro.
    MacroDefined { key: String },
    /// `{sigil}removemacro #name` removed a macro.
    MacroRemoved { key: String },
    /// A command was recognized (`/stopall`, `addmacro`, `removemacro`) but rejected: bad syntax,
    /// insufficient access, or (for removal) no such macro.
    CommandRejected,
}

/// The chat command surface (spec: "relevant to the core"). Everything else is either plain chat
/// (meme/macro/parse path) or out of scope (help, whitelist, exit/shutdown).
enum ChatCommand<'a> {
    StopAll,
    AddMacro { key: &'a str, expansion: &'a str },
    RemoveMacro { key: &'a str },
}

/// Recognizes `/stopall` and `{sigil}addmacro`/`{sigil}removemacro`. Anything else (including a
/// bare `{sigil}` with no match) returns `None` and falls through to macro expansion/parsing.
fn parse_command(text: &str, sigil: char) -> Option<ChatCommand<'_>> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("/stopall") {
        return Some(ChatCommand::StopAll);
    }
    let body = trimmed.strip_prefix(sigil)?;
    if let Some(rest) = body.strip_prefix("addmacro ") {
        let (key, expansion) = rest.trim_start().split_once(char::is_whitespace)?;
        return Some(ChatCommand::AddMacro { key, expansion: expansion.trim() });
    }
    if let Some(rest) = body.strip_prefix("removemacro ") {
        return Some(ChatCommand::RemoveMacro { key: rest.trim() });
    }
    None
}

/// Everything the adapter needs to translate chat text into HID dispatch.
/// Owned by the single C7 tick-loop thread; `handle_message` takes `&mut
/// self` rather than requiring interior locking, since nothing else touches
/// it concurrently.
pub struct Application<B: VirtualHidBackend + 'static> {
    pub users: UserStore,
    pub blacklist: Blacklist,
    pub macros: MacroStore,
    expander: MacroExpander,
    pub memes: HashMap<String, String>,
    vocabulary: InputVocabulary,
    parser_config: ParserConfig,
    pub settings: Settings,
    executor: Executor<B>,
    outbound: OutboundQueue,
}

impl<B: VirtualHidBackend + 'static> Application<B> {
    /// `persistence` backs the macro store's persistence callback (spec: "add/remove operations
    /// ... trigger a persistence callback"). Each mutation re-reads the current `bot_data.json`
    /// (to avoid clobbering users/memes written elsewhere), overlays the fresh macro snapshot, and
    /// writes it back.
    pub fn new(
        executor: Executor<B>,
        vocabulary: InputVocabulary,
        parser_config: ParserConfig,
        settings: Settings,
        outbound: OutboundQueue,
        persistence: Arc<dyn PersistenceBackend>,
    ) -> Self {
        let macros = MacroStore::with_persistence(move |store| {
            let mut data = persistence.load_bot_data().unwrap_or_default();
            data.macros = store.iter().map(|def| (def.key(), def.body.clone())).collect();
            if let Err(err) = persistence.save_bot_data(&data) {
                tracing::error!(target: "model.persistence", error = %err, "CRITICAL — Unable to save data");
            }
        });
        Self {
            users: UserStore::new(),
            blacklist: Blacklist::new(),
            macros,
            expander: MacroExpander::default(),
            memes: HashMap::new(),
            vocabulary,
            parser_config,
            settings,
            executor,
            outbound,
        }
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Runs one inbound chat message (spec §4.8) end to end: user
    /// lookup/creation, message-count bookkeeping, meme check, macro
    /// expansion, parsing, and on a valid result, dispatch plus
    /// auto-whitelist. `user_name` is expected pre-lowercased by the
    /// transport boundary; `UserStore` lowercases defensively regardless.
    pub fn handle_message(&mut self, user_name: &str, text: &str) -> AdapterOutcome {
        {
            let user = self.users.get_or_create(user_name);
            if !user.opted_out {
                user.message_count += 1;
            }
        }

        if let Some(command) = parse_command(text, self.settings.command_sigil) {
            return self.dispatch_command(user_name, command);
        }

        if let Some(reply) = self.memes.get(&text.to_ascii_lowercase()) {
            self.push_reply(reply.clone());
            return AdapterOutcome::MemeReply;
        }

        let expanded = match self.expander.expand(text, &self.macros) {
            Ok(expanded) => expanded,
            Err(err) => {
                tracing::debug!(target: "model.adapter", user = user_name, error = %err, "macro expansion failed");
                self.push_reply(format!("@{user_name} {err}"));
                return AdapterOutcome::ExpansionFailed(err);
            }
        };

        let issuer_level = self
            .users
            .get(user_name)
            .map(|u| u.access_level as u8)
            .unwrap_or(AccessLevel::User as u8);
        let required_level = |name: &str| self.blacklist.required_level_ordinal(name);
        let port_count = self.executor.controllers().lock().expect("controller lock poisoned").port_count();
        let ctx = ParseContext {
            vocabulary: &self.vocabulary,
            config: &self.parser_config,
            port_count,
            max_duration_ms: self.settings.max_input_duration_ms,
            max_simultaneous_duration_ms: self.settings.max_simultaneous_duration_ms,
            issuer_level,
            required_level: &required_level,
        };
        let sequence = core_input::parse(&expanded, &ctx);

        match sequence.outcome {
            ValidationOutcome::NormalMsg => AdapterOutcome::NormalMessage,
            ValidationOutcome::Valid => self.dispatch_valid_sequence(user_name, sequence),
            other => {
                self.push_reply(rejection_message(user_name, other));
                AdapterOutcome::Rejected(other)
            }
        }
    }

    fn dispatch_valid_sequence(&mut self, user_name: &str, sequence: core_input::InputSequence) -> AdapterOutcome {
        let Some(user) = self.users.get_mut(user_name) else {
            return AdapterOutcome::Rejected(ValidationOutcome::Invalid);
        };
        user.valid_input_count += 1;
        let Some(port) = user.port else {
            self.push_reply(format!("@{user_name} you have no assigned controller port yet"));
            return AdapterOutcome::PortUnavailable { port: usize::MAX };
        };

        {
            let controllers = self.executor.controllers().lock().expect("controller lock poisoned");
            if !controllers.is_port_valid(port) || !controllers.is_acquired(port) {
                drop(controllers);
                self.push_reply(format!("@{user_name} controller port {} is unavailable", port + 1));
                return AdapterOutcome::PortUnavailable { port };
            }
        }

        self.executor.submit(ExecutionRequest { port, sequence });

        let threshold = self.settings.auto_whitelist_input_count;
        let enabled = self.settings.auto_whitelist_enabled;
        if self.users.apply_auto_whitelist(user_name, threshold, enabled) {
            let msg = self.settings.auto_whitelist_msg.replacen("{0}", user_name, 1);
            self.push_reply(msg);
        }

        AdapterOutcome::Dispatched { port }
    }

    /// Runs `/stopall` and the `addmacro`/`removemacro` command surface. Both macro mutations and
    /// the blanket cancel are gated at `PRIVILEGED_COMMAND_LEVEL` since, unlike an input sequence,
    /// they affect every user's in-flight sequences or the shared macro namespace rather than just
    /// the issuer.
    fn dispatch_command(&mut self, user_name: &str, command: ChatCommand) -> AdapterOutcome {
        let issuer_level = self
            .users
            .get(user_name)
            .map(|u| u.access_level)
            .unwrap_or(AccessLevel::User);

        match command {
            ChatCommand::StopAll => {
                if issuer_level < PRIVILEGED_COMMAND_LEVEL {
                    self.push_reply(format!("@{user_name} you don't have permission to stop all sequences"));
                    return AdapterOutcome::CommandRejected;
                }
                let port_count = self.executor.controllers().lock().expect("controller lock poisoned").port_count();
                for port in 0..port_count {
                    self.executor.cancel_port(port);
                }
                tracing::info!(target: "model.adapter", user = user_name, "stopall issued");
                AdapterOutcome::StoppedAll
            }
            ChatCommand::AddMacro { key, expansion } => {
                if issuer_level < PRIVILEGED_COMMAND_LEVEL {
                    self.push_reply(format!("@{user_name} you don't have permission to add macros"));
                    return AdapterOutcome::CommandRejected;
                }
                if expansion.is_empty() {
                    self.push_reply(format!("@{user_name} usage: {}addmacro #name expansion", self.settings.command_sigil));
                    return AdapterOutcome::CommandRejected;
                }
                match self.macros.insert(key, expansion) {
                    Ok(()) => {
                        self.push_reply(format!("@{user_name} macro {key} saved"));
                        AdapterOutcome::MacroDefined { key: key.to_string() }
                    }
                    Err(err) => {
                        self.push_reply(format!("@{user_name} {err}"));
                        AdapterOutcome::CommandRejected
                    }
                }
            }
            ChatCommand::RemoveMacro { key } => {
                if issuer_level < PRIVILEGED_COMMAND_LEVEL {
                    self.push_reply(format!("@{user_name} you don't have permission to remove macros"));
                    return AdapterOutcome::CommandRejected;
                }
                match self.macros.remove(key) {
                    Some(_) => {
                        self.push_reply(format!("@{user_name} macro {key} removed"));
                        AdapterOutcome::MacroRemoved { key: key.to_string() }
                    }
                    None => {
                        self.push_reply(format!("@{user_name} no macro named {key}"));
                        AdapterOutcome::CommandRejected
                    }
                }
            }
        }
    }

    /// Enqueues an outbound chat reply, splitting at `bot_message_char_limit` (spec §6) first.
    fn push_reply(&self, message: String) {
        self.outbound.push_with_limit(message, self.settings.bot_message_char_limit);
    }
}

fn rejection_message(user_name: &str, outcome: ValidationOutcome) -> String {
    let reason = match outcome {
        ValidationOutcome::Invalid => "that input sequence wasn't understood",
        ValidationOutcome::BlacklistedInput => "one of those inputs is above your access level",
        ValidationOutcome::ExceededMaxDuration => "that hold is longer than the allowed maximum",
        ValidationOutcome::ExceededMaxSimultaneousDuration => "too many inputs held simultaneously for too long",
        ValidationOutcome::InvalidPortNumber => "that controller port doesn't exist",
        ValidationOutcome::InvalidInput => "an axis percent must be between 0 and 100",
        ValidationOutcome::Valid | ValidationOutcome::NormalMsg => unreachable!("handled before reaching here"),
    };
    format!("@{user_name} {reason}")
}
