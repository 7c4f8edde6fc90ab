use catcount::cmd::job::Args;
use catcount::standalone::{prepare_job, JobReport};
use catcount::telemetry::init_tracing;
use catcount::JobError;
use clap::Parser;
use std::process::ExitCode;

async fn submit(args: Args) -> Result<JobReport, JobError> {
    let (config, output) = args.into_config()?;
    let runner = prepare_job(config, &output)?;

    let cancel = runner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling job");
            cancel.cancel();
        }
    });

    runner.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => e.exit(),
    };
    if let Err(e) = init_tracing(args.verbose) {
        eprintln!("{e:#}");
    }

    match submit(args).await {
        Ok(report) => {
            print!("{}", report.counters);
            println!(
                "job {} {}: {} map task(s), {} reduce task(s), {} key(s) in {:.2?}",
                report.job_id,
                report.state,
                report.map_tasks,
                report.reduce_tasks,
                report.distinct_keys,
                report.elapsed
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", catcount::error::Chain(&e).to_string().trim_end());
            // exit codes are 1 or 2
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
