//! Origin tags.
//!
//! Every stored cell records which subsystem last wrote it. The tag is a
//! closed sum type in memory; the string forms (`remote`, `local-terminal`,
//! `worker`, `bot-<name>`, `system`) appear only at the store and KV
//! boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Origin {
	/// The remote sheet; never pushed back outbound.
	Remote,
	/// Direct SQL against the store.
	LocalTerminal,
	/// Applied by the job-queue worker.
	Worker,
	/// A named stress-test bot.
	Bot(String),
	/// Written during bootstrap.
	System,
}

impl Origin {
	pub fn is_remote(&self) -> bool {
		matches!(self, Self::Remote)
	}
}

impl fmt::Display for Origin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Remote => f.write_str("remote"),
			Self::LocalTerminal => f.write_str("local-terminal"),
			Self::Worker => f.write_str("worker"),
			Self::Bot(name) => write!(f, "bot-{name}"),
			Self::System => f.write_str("system"),
		}
	}
}

impl From<Origin> for String {
	fn from(origin: Origin) -> Self {
		origin.to_string()
	}
}

impl TryFrom<String> for Origin {
	type Error = String;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		match s.as_str() {
			"remote" => Ok(Self::Remote),
			"local-terminal" => Ok(Self::LocalTerminal),
			"worker" => Ok(Self::Worker),
			"system" => Ok(Self::System),
			other => match other.strip_prefix("bot-") {
				Some(name) if !name.is_empty() => Ok(Self::Bot(name.to_string())),
				_ => Err(format!("unknown origin tag {s:?}")),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_round_trip() {
		for origin in [
			Origin::Remote,
			Origin::LocalTerminal,
			Origin::Worker,
			Origin::Bot("stress-7".into()),
			Origin::System,
		] {
			let s = origin.to_string();
			assert_eq!(Origin::try_from(s).unwrap(), origin);
		}
	}

	#[test]
	fn rejects_unknown_tags() {
		assert!(Origin::try_from("cloud".to_string()).is_err());
		assert!(Origin::try_from("bot-".to_string()).is_err());
	}
}
