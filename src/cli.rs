// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use vane_model::TaskKind;

#[derive(Debug, Parser)]
#[command(
    name = "vane",
    about = "Client-side request orchestration for an OpenAI-compatible chat completions backend",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the orchestration config file (JSON). Falls back to
    /// `.vane/config.json`, `vane.json`, or `/etc/vane/config.json`.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Send a single chat request through the full orchestration pipeline
    /// (routing, context assembly, caching, dispatch) and print the response.
    Chat {
        /// The user message to send.
        prompt: String,
        /// Task kind used for routing and system-prompt selection.
        #[arg(long, value_enum, default_value = "casual-chat")]
        task: TaskArg,
        /// Priority used when scheduling this request.
        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,
        /// Session id whose history this turn is appended to.
        #[arg(long, default_value = "default")]
        session: String,
        /// Stream the response to stdout as it arrives instead of waiting
        /// for the full completion.
        #[arg(long)]
        stream: bool,
    },

    /// Print the effective configuration (sensitive values redacted) and any
    /// validation warnings or errors.
    ShowConfig,

    /// List the models the registry would load from the active config.
    Models {
        /// Print as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

/// `clap::ValueEnum` mirror of [`TaskKind`] so task kinds are selectable from
/// the command line with kebab-case names.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TaskArg {
    CasualChat,
    CodeDiscussion,
    TechnicalQna,
    CodeGeneration,
    CodeAnalysis,
    CodeReview,
    CodeExplanation,
    BugFix,
    ProjectAnalysis,
    ArchitectureDesign,
    Documentation,
    AgentDecision,
    AgentReasoning,
    ContextUnderstanding,
    SpeechRecognition,
    SpeechSynthesis,
    VisionAnalysis,
    VisionDescription,
    SceneUnderstanding,
    ProactiveResponse,
    ToolCalling,
    CodeToolExecution,
}

impl From<TaskArg> for TaskKind {
    fn from(arg: TaskArg) -> Self {
        match arg {
            TaskArg::CasualChat => TaskKind::CasualChat,
            TaskArg::CodeDiscussion => TaskKind::CodeDiscussion,
            TaskArg::TechnicalQna => TaskKind::TechnicalQnA,
            TaskArg::CodeGeneration => TaskKind::CodeGeneration,
            TaskArg::CodeAnalysis => TaskKind::CodeAnalysis,
            TaskArg::CodeReview => TaskKind::CodeReview,
            TaskArg::CodeExplanation => TaskKind::CodeExplanation,
            TaskArg::BugFix => TaskKind::BugFix,
            TaskArg::ProjectAnalysis => TaskKind::ProjectAnalysis,
            TaskArg::ArchitectureDesign => TaskKind::ArchitectureDesign,
            TaskArg::Documentation => TaskKind::Documentation,
            TaskArg::AgentDecision => TaskKind::AgentDecision,
            TaskArg::AgentReasoning => TaskKind::AgentReasoning,
            TaskArg::ContextUnderstanding => TaskKind::ContextUnderstanding,
            TaskArg::SpeechRecognition => TaskKind::SpeechRecognition,
            TaskArg::SpeechSynthesis => TaskKind::SpeechSynthesis,
            TaskArg::VisionAnalysis => TaskKind::VisionAnalysis,
            TaskArg::VisionDescription => TaskKind::VisionDescription,
            TaskArg::SceneUnderstanding => TaskKind::SceneUnderstanding,
            TaskArg::ProactiveResponse => TaskKind::ProactiveResponse,
            TaskArg::ToolCalling => TaskKind::ToolCalling,
            TaskArg::CodeToolExecution => TaskKind::CodeToolExecution,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Critical,
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for vane_model::TaskPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Critical => vane_model::TaskPriority::Critical,
            PriorityArg::High => vane_model::TaskPriority::High,
            PriorityArg::Normal => vane_model::TaskPriority::Normal,
            PriorityArg::Low => vane_model::TaskPriority::Low,
        }
    }
}
