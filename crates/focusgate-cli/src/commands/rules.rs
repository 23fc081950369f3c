use crate::common;

/// Print the blocking rules the current state derives.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = common::start().await?;
    // Engine startup already ran a rule pass; the in-process host now
    // holds exactly what a browser host would have installed.
    let rules = cli.rule_host.rules();
    println!("{}", serde_json::to_string_pretty(&rules)?);
    Ok(())
}
