use focusgate_core::Command;

use crate::common;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = common::start().await?;
    common::print_response(cli.engine.handle(Command::GetTodayUsage).await)
}
