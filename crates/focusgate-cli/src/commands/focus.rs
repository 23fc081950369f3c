use clap::Subcommand;
use focusgate_core::Command;

use crate::common;

#[derive(Subcommand)]
pub enum FocusAction {
    /// Turn focus mode on
    On,
    /// Turn focus mode off
    Off,
    /// Print the current focus state as JSON
    Status,
}

pub async fn run(action: FocusAction) -> Result<(), Box<dyn std::error::Error>> {
    let cli = common::start().await?;
    let command = match action {
        FocusAction::On => Command::EnableFocus,
        FocusAction::Off => Command::DisableFocus,
        FocusAction::Status => Command::GetFocusState,
    };
    common::print_response(cli.engine.handle(command).await)
}
