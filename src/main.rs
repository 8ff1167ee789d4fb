use std::process::ExitCode;

fn main() -> ExitCode {
    pi_dashboard_lib::run()
}
