use crate::conveyor::ConveyorPacker;
use crate::RuntimeError;
use kiln_bundle::Bundle;
use tracing::info;

/// `bootstrap: scratch`: an empty rootfs, filled only by `%files` and
/// `%setup`.
#[derive(Debug, Default)]
pub struct ScratchConveyorPacker;

impl ConveyorPacker for ScratchConveyorPacker {
    fn name(&self) -> &'static str {
        "scratch"
    }

    fn get(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError> {
        info!("starting from an empty rootfs at {}", bundle.rootfs().display());
        Ok(())
    }
}
