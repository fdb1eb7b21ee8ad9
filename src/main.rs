//! concept-eval CLI: extract concepts from a language model and evaluate them
//!
//! Every configuration key is also a flag, e.g. `--dict_mult 2` or
//! `--evaluators '["itc-uci", "replace-loss"]'`.

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use concept_eval::{Config, Pipeline};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn cli() -> Command {
    let mut cmd = Command::new("concept-eval")
        .about("Concept extraction and evaluation for transformer language models")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("JSON file with config keys, applied before the flags"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        );
    for key in Config::keys() {
        cmd = cmd.arg(
            Arg::new(key.clone())
                .long(key)
                .value_name("VALUE")
                .help_heading("Config keys"),
        );
    }
    cmd
}

/// `(key, raw value)` for every config key given on the command line
fn overrides(matches: &ArgMatches) -> Vec<(String, String)> {
    Config::keys()
        .into_iter()
        .filter_map(|key| {
            let value = matches.get_one::<String>(&key)?.clone();
            Some((key, value))
        })
        .collect()
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    // Initialize logging
    let level = if matches.get_flag("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut cfg = match matches.get_one::<String>("config") {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    cfg.apply_overrides(&overrides(&matches))?;

    let pipeline = Pipeline::load(cfg)?;
    info!("Loaded model...");
    println!("{}", serde_json::to_string_pretty(pipeline.config())?);

    let summary = pipeline.run()?;

    println!("\n=== Results ===");
    println!(
        "Critical tokens of concept {}: {:?}",
        summary.concept_idx, summary.critical_tokens.tokens
    );
    println!("{}: {:.4}", summary.evaluator, summary.evaluation.value);
    if let Some(report) = &summary.metric_report {
        println!("Metric evaluation ({}):", report.code);
        for (name, row) in report.evaluators.iter().zip(&report.metrics) {
            println!("  {name:<28} {row:.4?}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_has_a_flag_per_key() {
        let matches = cli()
            .try_get_matches_from([
                "concept-eval",
                "--dict_mult",
                "2",
                "--ConceptX_clusters",
                "4",
                "-v",
            ])
            .unwrap();
        let pairs = overrides(&matches);
        assert!(pairs.contains(&("dict_mult".to_string(), "2".to_string())));
        assert!(pairs.contains(&("ConceptX_clusters".to_string(), "4".to_string())));
        assert!(matches.get_flag("verbose"));
    }

    #[test]
    fn test_cli_rejects_unknown_flag() {
        assert!(cli()
            .try_get_matches_from(["concept-eval", "--dict_multiplier", "2"])
            .is_err());
    }
}
