//! Kernel attribute vocabulary shared between the executor, the pool, and
//! the kernel manager (spec §3 "Kernel").

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelMode {
    Worker,
    MainThread,
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelMode::Worker => write!(f, "worker"),
            KernelMode::MainThread => write!(f, "main-thread"),
        }
    }
}

impl FromStr for KernelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(KernelMode::Worker),
            "main-thread" | "main_thread" => Ok(KernelMode::MainThread),
            other => Err(format!("unknown kernel mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Typescript,
    Javascript,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Typescript => write!(f, "typescript"),
            Language::Javascript => write!(f, "javascript"),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "typescript" | "ts" => Ok(Language::Typescript),
            "javascript" | "js" => Ok(Language::Javascript),
            other => Err(format!("unknown kernel language: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Starting,
    Idle,
    Busy,
    Interrupted,
    Dead,
}
