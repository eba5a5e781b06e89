//! Post-provisioning reboot

use tracing::info;

use crate::PrepError;
use crate::config::{ParameterSet, PlatformContext};
use crate::error::StepExecutionError;
use crate::runner::executor::{display_command, run_program};

/// Parameter that suppresses the reboot
pub const NO_REBOOT: &str = "noreboot";

/// Schedule the platform restart unless `noreboot` is set.
///
/// Returns whether a restart was scheduled.
pub async fn reboot_unless_suppressed(
    ctx: &PlatformContext,
    overrides: &ParameterSet,
) -> Result<bool, PrepError> {
    if overrides.flag(NO_REBOOT) {
        info!("Detected `noreboot` switch. System will not be rebooted.");
        return Ok(false);
    }

    info!("Reboot scheduled. System will reboot after the script exits.");
    let (program, leading) = ctx
        .shell
        .split_first()
        .ok_or_else(|| PrepError::Command("no shell configured".to_string()))?;
    let mut args = leading.to_vec();
    args.push(ctx.restart_command.clone());

    let result = run_program(program, &args).await?;
    if !result.success() {
        return Err(StepExecutionError::NonZeroExit {
            command: display_command(program, &args),
            code: result.exit_code,
        }
        .into());
    }
    Ok(true)
}
