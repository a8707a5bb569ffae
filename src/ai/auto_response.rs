use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Regla de respuesta automática tal como se guarda en JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRule {
    pub name: String,
    pub patterns: Vec<String>,
    pub responses: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

struct CompiledRule {
    name: String,
    matcher: Regex,
    responses: Vec<String>,
}

/// Ordered keyword rules; the first rule that matches answers.
pub struct AutoResponder {
    rules: Vec<CompiledRule>,
    enabled: bool,
}

impl AutoResponder {
    pub fn new(rules: Vec<AutoRule>, enabled: bool) -> Result<Self> {
        let rules = rules
            .into_iter()
            .filter(|r| !r.patterns.is_empty() && !r.responses.is_empty())
            .map(compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, enabled })
    }

    /// Loads rules from `path` when it exists, else the built-in set.
    pub fn load(path: Option<&Path>, enabled: bool) -> Result<Self> {
        let rules = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                let rules: Vec<AutoRule> = serde_json::from_str(&content)
                    .with_context(|| format!("invalid auto responses in {}", path.display()))?;
                info!("💬 {} reglas de auto respuesta cargadas de {}", rules.len(), path.display());
                rules
            }
            _ => default_rules(),
        };
        Self::new(rules, enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Name of the first rule matching the text.
    pub fn matching_rule(&self, text: &str) -> Option<&str> {
        self.find(text).map(|r| r.name.as_str())
    }

    /// A random response of the first matching rule.
    pub fn respond(&self, text: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let rule = self.find(text)?;
        debug!("💬 Regla '{}' coincide", rule.name);
        rule.responses.choose(&mut rand::thread_rng()).cloned()
    }

    fn find(&self, text: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.matcher.is_match(text))
    }
}

fn compile(rule: AutoRule) -> Result<CompiledRule> {
    let alternatives: Vec<String> = rule.patterns.iter().map(|p| regex::escape(p)).collect();
    let pattern = format!(r"\b(?:{})\b", alternatives.join("|"));
    let matcher = RegexBuilder::new(&pattern)
        .case_insensitive(!rule.case_sensitive)
        .build()
        .with_context(|| format!("bad patterns in rule '{}'", rule.name))?;

    Ok(CompiledRule { name: rule.name, matcher, responses: rule.responses })
}

fn rule(name: &str, patterns: &[&str], responses: &[&str]) -> AutoRule {
    AutoRule {
        name: name.to_string(),
        patterns: patterns.iter().map(|s| s.to_string()).collect(),
        responses: responses.iter().map(|s| s.to_string()).collect(),
        case_sensitive: false,
    }
}

pub fn default_rules() -> Vec<AutoRule> {
    vec![
        rule(
            "greeting",
            &["hello", "hi", "hey", "greetings", "sup", "what's up"],
            &[
                "Hello there! How can I help you today?",
                "Hi! Feel free to ask me anything or play some music!",
                "Hey! What would you like to listen to today?",
                "Greetings! How's your day going?",
            ],
        ),
        rule(
            "thanks",
            &["thank you", "thanks", "thx", "thank", "appreciate it"],
            &["You're welcome!", "No problem!", "Happy to help!", "My pleasure!"],
        ),
        rule(
            "goodbye",
            &["bye", "goodbye", "see you", "cya", "gotta go", "gtg"],
            &[
                "Goodbye! Come back soon!",
                "See you later!",
                "Take care!",
                "Bye! Let me know if you need anything else!",
            ],
        ),
        rule(
            "music",
            &["play music", "song", "play song", "some music", "some tunes"],
            &[
                "I'd be happy to play music for you! Try using the /play command followed by a song name.",
                "Ready for some tunes! Use /play followed by a song name to start playing.",
                "Want to listen to music? Use /search to find your favorite songs.",
                "I can play music for you! Just use the /play command followed by what you want to hear.",
            ],
        ),
    ]
}
