use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match medread_lib::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "MedRead failed to start");
            ExitCode::FAILURE
        }
    }
}
