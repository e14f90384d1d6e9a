use clap::Parser;
use log::info;
use pric3::{logger, model::Program, Pric3, Pric3Options};

fn main() -> anyhow::Result<()> {
    logger::init_logger(log::Level::Info);
    let options = Pric3Options::parse();
    let program = Program::from_path(&options.model)?;
    info!(
        "checking whether P(goal) <= {} holds for {}",
        options.lambda, program.name
    );

    let config = z3::Config::new();
    let context = z3::Context::new(&config);
    let mut driver = Pric3::new(&context, program, &options)?;
    let outcome = driver.run()?;

    info!("{outcome}");
    driver.statistics().log_summary();
    if let Some(path) = &options.save_stats {
        driver.statistics().save(path)?;
    }
    if let Some(path) = &options.save_oracle {
        driver.oracle().save(path)?;
    }

    Ok(())
}
