use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let working_dir = std::env::current_dir().expect("failed to resolve working directory");

    match flowrelay::run(&working_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("flowrelay: startup failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
