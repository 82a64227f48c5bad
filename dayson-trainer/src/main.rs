use anyhow::{Context, Result};
use clap::{arg, ArgMatches, Command};
use dayson_engine::{HostMathEngine, MathEngine};
use dayson_model::LstmConfig;
use dayson_trainer::{LogSink, Trainer, TrainerConfig};
use std::fs;
use std::path::PathBuf;

#[cfg(feature = "cuda")]
use dayson_engine::CudaMathEngine;

fn cli() -> Command {
    Command::new("dayson-trainer")
        .about("Trains the disk-backed LSTM on a byte-level corpus")
        .arg_required_else_help(true)
        .arg(
            arg!(<CORPUS> "Path to the training corpus")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            arg!(--root [ROOT] "Data directory")
                .default_value("./Dayson")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            arg!(--epochs [EPOCHS] "Number of training epochs")
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            arg!(--embedding [EMBEDDING] "Embedding width")
                .default_value("64")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            arg!(--hidden [HIDDEN] "Hidden state width")
                .default_value("128")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            arg!(--context [CONTEXT] "Tokens per training window")
                .default_value("64")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            arg!(--batch [BATCH] "Sequence pairs per batch block")
                .default_value("16")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            arg!(--lr [LR] "Learning rate")
                .default_value("0.002")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            arg!(--"val-split" [VAL_SPLIT] "Fraction of batches held out for validation")
                .default_value("0.1")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            arg!(--seed [SEED] "Weight initialization seed")
                .default_value("42")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            arg!(--gpu [GPU] "Train on the given CUDA device instead of the host")
                .value_parser(clap::value_parser!(usize)),
        )
}

fn main() {
    env_logger::init();
    let matches = cli().get_matches();
    if let Err(e) = run(&matches) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn build_engine(matches: &ArgMatches) -> Result<Box<dyn MathEngine>> {
    match matches.get_one::<usize>("gpu") {
        #[cfg(feature = "cuda")]
        Some(&ordinal) => Ok(Box::new(CudaMathEngine::new(ordinal)?)),
        #[cfg(not(feature = "cuda"))]
        Some(_) => anyhow::bail!("this build has no device backend; rebuild with --features cuda"),
        None => Ok(Box::new(HostMathEngine::new())),
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let corpus_path = matches.get_one::<PathBuf>("CORPUS").expect("required arg");
    let bytes = fs::read(corpus_path)
        .with_context(|| format!("reading corpus {}", corpus_path.display()))?;
    // byte-level tokens: the identity vocabulary of size 256
    let corpus: Vec<i32> = bytes.iter().map(|&b| b as i32).collect();
    drop(bytes);

    let lstm_config = LstmConfig::new(
        256,
        *matches.get_one::<usize>("embedding").expect("default"),
        *matches.get_one::<usize>("hidden").expect("default"),
        256,
    );
    let mut config = TrainerConfig::new(matches.get_one::<PathBuf>("root").expect("default").clone());
    config.epochs = *matches.get_one::<usize>("epochs").expect("default");
    config.context = *matches.get_one::<usize>("context").expect("default");
    config.batch_size = *matches.get_one::<usize>("batch").expect("default");
    config.learning_rate = *matches.get_one::<f32>("lr").expect("default");
    config.val_split = *matches.get_one::<f32>("val-split").expect("default");
    config.seed = *matches.get_one::<u64>("seed").expect("default");

    let engine = build_engine(matches)?;
    let sink = LogSink;
    let mut trainer = Trainer::new(engine.as_ref(), &sink, config, lstm_config)?;
    trainer.prepare_dataset(&corpus)?;
    drop(corpus);

    let report = trainer.run()?;
    for (epoch, (train, validation)) in report
        .epoch_train_loss
        .iter()
        .zip(&report.epoch_validation_loss)
        .enumerate()
    {
        println!("epoch {epoch}: train loss {train:.4}, validation loss {validation:.4}");
    }
    if report.failed_batches > 0 {
        println!("{} batches failed and were skipped", report.failed_batches);
    }
    Ok(())
}
