//! Unattended domain events.
//!
//! A guest that halts, reboots or crashes on its own is noticed through the
//! hypervisor's event channel. The VM's configured lifecycle action is then
//! carried out as a task queued behind any operation already in flight.

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use vmplane_hypervisor::{DomId, DomainEvent, DomainEventKind, LifecycleAction, ShutdownReason};

use super::hooks::{REASON_HARD_REBOOT, REASON_HARD_SHUTDOWN, REASON_NONE, VM_PRE_START};
use super::NodeService;
use crate::error::{Error, Result};
use crate::model::PowerState;
use crate::task::TaskContext;

impl NodeService {
    /// React to a domain event. Returns the id of the task carrying out the
    /// VM's lifecycle action, if one was started.
    pub fn handle_domain_event(&self, event: DomainEvent) -> Result<Option<String>> {
        let DomainEventKind::Shutdown(reason) = event.kind;
        let vm = match self.store().vm_by_domid(event.domid)? {
            Some(vm) => vm,
            None => {
                debug!(domid = event.domid, "Event for unknown domain");
                return Ok(None);
            }
        };

        let action = match reason {
            ShutdownReason::Halt => vm.config.on_shutdown,
            ShutdownReason::Reboot => vm.config.on_reboot,
            ShutdownReason::Crash => vm.config.on_crash,
            ShutdownReason::Suspend => {
                info!(vm_id = %vm.config.id, domid = event.domid, "Guest suspended itself");
                return Ok(None);
            }
        };
        info!(vm_id = %vm.config.id, domid = event.domid, ?reason, ?action, "Domain shut down");

        let svc = self.clone();
        let vm_id = vm.config.id.clone();
        let domid = event.domid;
        let task = self.tasks().submit(
            "domain-event",
            "VM.handle_shutdown",
            Some(&vm.config.id),
            move |ctx| async move {
                // The domain may have been replaced while this task was queued.
                if svc.store().vm(&vm_id)?.state.domid() != Some(domid) {
                    debug!(vm_id = %vm_id, domid, "Stale domain event");
                    return Ok(None);
                }
                svc.apply_lifecycle_action(&ctx, &vm_id, domid, action).await?;
                Ok(Some(json!({ "action": action })))
            },
        );
        Ok(Some(task))
    }

    async fn apply_lifecycle_action(&self, ctx: &TaskContext, id: &str, domid: DomId, action: LifecycleAction) -> Result<()> {
        match action {
            LifecycleAction::Coredump => {
                let path = self
                    .config()
                    .dump_dir
                    .join(format!("{}-{}.core", id, domid))
                    .display()
                    .to_string();
                ctx.subtask("VM.dump_core", async {
                    self.hypervisor()
                        .dump_core(domid, &path)
                        .await
                        .map_err(Error::from)
                })
                .await?;
                self.destroy_sequence(ctx, id, REASON_HARD_SHUTDOWN).await
            }
            LifecycleAction::Shutdown => self.destroy_sequence(ctx, id, REASON_HARD_SHUTDOWN).await,
            LifecycleAction::Restart => {
                self.destroy_sequence(ctx, id, REASON_HARD_REBOOT).await?;
                self.run_hooks(VM_PRE_START, id, REASON_NONE).await?;
                self.start_sequence(ctx, id).await
            }
            LifecycleAction::Pause => {
                self.hypervisor().pause_domain(domid).await?;
                self.store()
                    .update_vm(id, |vm| vm.state.power_state = PowerState::Paused)?;
                Ok(())
            }
        }
    }

    /// Feed hypervisor events into [`NodeService::handle_domain_event`]
    /// until the hypervisor closes its channel.
    pub async fn run_event_pump(&self) {
        let mut events = self.hypervisor().subscribe_events();
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle_domain_event(event) {
                        warn!(error = %e, "Failed to handle domain event");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Dropped domain events");
                }
                Err(RecvError::Closed) => {
                    info!("Domain event channel closed");
                    break;
                }
            }
        }
    }
}
