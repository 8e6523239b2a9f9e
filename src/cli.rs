//! visiond - command line for the detection pipeline
//!
//! Every command opens the pipeline from `VISION_*` configuration, runs one
//! operation and prints its result as JSON on stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::IsTerminal;
use std::time::Duration;

use crate::model::{DetectionStatus, ObjectUpdate, ReviewRequest};
use crate::ui::Ui;
use crate::video::parse_hint_item_ids;
use crate::{Pipeline, PipelineConfig, VideoOptions};

#[derive(Parser, Debug)]
#[command(name = "visiond", about = "Item detection, matching and review")]
struct Args {
    /// Override the configured database path
    #[arg(long, global = true, env = "VISION_DB_PATH")]
    db: Option<String>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, global = true, default_value = "auto", value_name = "MODE")]
    ui: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze one stored photo
    Analyze {
        #[arg(long)]
        media: i64,
    },

    /// Analyze sampled frames of a stored video
    AnalyzeVideo {
        #[arg(long)]
        media: i64,
        #[arg(long)]
        stride: Option<i64>,
        #[arg(long)]
        max_frames: Option<i64>,
        /// Item ids forced onto every object, separated by `,` or `;`
        #[arg(long)]
        hints: Option<String>,
    },

    /// Accept all objects of a detection
    Accept {
        #[arg(long)]
        detection: i64,
        #[arg(long)]
        item: Option<i64>,
        #[arg(long)]
        location: Option<i64>,
        #[arg(long)]
        actor: Option<i64>,
    },

    /// Reject all objects of a detection
    Reject {
        #[arg(long)]
        detection: i64,
        #[arg(long)]
        item: Option<i64>,
        #[arg(long)]
        location: Option<i64>,
        #[arg(long)]
        actor: Option<i64>,
    },

    /// Relink or redecide a single detection object
    UpdateObject {
        #[arg(long)]
        object: i64,
        #[arg(long)]
        item: Option<i64>,
        #[arg(long)]
        location: Option<i64>,
        /// pending|accepted|rejected
        #[arg(long)]
        decision: Option<String>,
        #[arg(long)]
        actor: Option<i64>,
    },

    /// Append a review log entry without changing the detection
    LogReview {
        #[arg(long)]
        detection: i64,
        /// accept|reject|link_existing|create_new|fix_location
        #[arg(long)]
        action: String,
        /// JSON payload stored with the entry
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        actor: Option<i64>,
    },

    /// Print one detection with objects and candidates
    Show {
        #[arg(long)]
        detection: i64,
        /// Include the review log
        #[arg(short, long)]
        verbose: bool,
    },

    /// List detections by status
    List {
        #[arg(long, default_value = "in_progress")]
        status: String,
    },

    /// Fail in_progress detections older than the threshold
    Sweep {
        /// Seconds; defaults to the configured stale_after
        #[arg(long)]
        older_than: Option<u64>,
    },
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = PipelineConfig::load()?;
    if let Some(db) = args.db {
        cfg.db_path = db;
    }
    let mut pipeline = {
        let _stage = ui.stage("Open pipeline");
        Pipeline::open(&cfg)?
    };

    match args.command {
        Command::Analyze { media } => {
            let detection = {
                let _stage = ui.stage("Analyze photo");
                pipeline.analyze(media)?
            };
            print_json(&detection)
        }
        Command::AnalyzeVideo {
            media,
            stride,
            max_frames,
            hints,
        } => {
            let options = VideoOptions {
                frame_stride: stride,
                max_frames,
                hint_item_ids: parse_hint_item_ids(hints.as_deref()),
            };
            let progress = ui.frames("Analyze video");
            let ids = pipeline.analyze_video_with(media, options, &mut |p| progress.update(p))?;
            drop(progress);
            print_json(&ids)
        }
        Command::Accept {
            detection,
            item,
            location,
            actor,
        } => {
            let request = ReviewRequest {
                item_id: item,
                location_id: location,
            };
            print_json(&pipeline.accept(detection, request, actor)?)
        }
        Command::Reject {
            detection,
            item,
            location,
            actor,
        } => {
            let request = (item.is_some() || location.is_some()).then_some(ReviewRequest {
                item_id: item,
                location_id: location,
            });
            print_json(&pipeline.reject(detection, request, actor)?)
        }
        Command::UpdateObject {
            object,
            item,
            location,
            decision,
            actor,
        } => {
            let update = ObjectUpdate {
                item_id: item,
                location_id: location,
                decision: decision.as_deref().map(str::parse).transpose()?,
            };
            print_json(&pipeline.update_object(object, update, actor)?)
        }
        Command::LogReview {
            detection,
            action,
            payload,
            actor,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            pipeline.log_review(detection, action.parse()?, payload, actor)?;
            print_json(&pipeline.review_log(detection)?)
        }
        Command::Show { detection, verbose } => {
            print_json(&pipeline.detection(detection)?)?;
            if verbose {
                print_json(&pipeline.review_log(detection)?)?;
            }
            Ok(())
        }
        Command::List { status } => {
            let status: DetectionStatus = status.parse()?;
            print_json(&pipeline.list_detections(status)?)
        }
        Command::Sweep { older_than } => {
            let older_than = older_than
                .map(Duration::from_secs)
                .unwrap_or(cfg.stale_after);
            let swept = {
                let _stage = ui.stage("Sweep stale detections");
                pipeline.sweep_stale(older_than)?
            };
            print_json(&swept)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
