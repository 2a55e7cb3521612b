//! Component reconciler: one generic state machine shared by every kind.
//!
//! Pending → Installing → Ready → Upgrading → Ready | Error, with Waiting
//! while a prerequisite is not Ready and Deleting while the finalizer runs.
//! A pass over a Ready component with an unchanged spec performs no writes.

use std::time::{Duration, Instant};

use metrics::histogram;
use tracing::{debug, info, warn};

use keel_apply::Bundle;
use keel_core::conditions::{DEPENDENCIES_READY, INSTALLER_SET_READY, READY, SPEC_VALID};
use keel_core::{
    Component, ComponentKind, ComponentPhase, ComponentStatus, Condition, Error, InstallerSet,
    LabelSelector, Object, ObjectKey, Result, FINALIZER,
};
use keel_kubehub::typed;
use keel_transform::render;

use crate::{Action, Context};

/// Reconcile the component stored under `key`.
pub async fn reconcile_component(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let Some(component) = typed::get::<Component>(&*ctx.store, key).await? else {
        debug!(component = %key, "component gone");
        return Ok(Action::AwaitChange);
    };
    let t0 = Instant::now();
    let action = if component.metadata.is_deleting() {
        finalize(ctx, component).await
    } else {
        let component = ensure_finalizer(ctx, component).await?;
        converge(ctx, component).await
    };
    histogram!("component_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
    action
}

async fn ensure_finalizer(ctx: &Context, mut component: Component) -> Result<Component> {
    if component.metadata.has_finalizer(FINALIZER) {
        return Ok(component);
    }
    component.metadata.finalizers.push(FINALIZER.to_string());
    debug!(component = %component.key(), "adding finalizer");
    typed::update(&*ctx.store, &component).await
}

/// Write `status` when it differs from what the component carries.
async fn write_status(ctx: &Context, component: &Component, status: &ComponentStatus) -> Result<Component> {
    if component.status.as_ref() == Some(status) {
        return Ok(component.clone());
    }
    debug!(component = %component.key(), phase = %status.phase, "writing component status");
    typed::replace_status(&*ctx.store, component, &serde_json::to_value(status)?).await
}

/// Terminal failure for the current inputs (invalid spec, untransformable
/// release). Cleared only when the spec changes.
fn mark_terminal(status: &mut ComponentStatus, err: &Error, generation: i64) {
    status.phase = ComponentPhase::Error;
    if matches!(err, Error::Validation { .. }) {
        status
            .conditions
            .mark_false(SPEC_VALID, err.reason(), err.to_string());
    }
    status
        .conditions
        .mark_false(READY, err.reason(), err.to_string());
    status.observed_generation = generation;
}

/// First prerequisite kind without a Ready component in the same namespace.
async fn blocking_prerequisite(ctx: &Context, component: &Component) -> Result<Option<ComponentKind>> {
    let prereqs = ctx.graph.prerequisites(&component.spec.kind);
    if prereqs.is_empty() {
        return Ok(None);
    }
    let siblings: Vec<Component> = typed::list(
        &*ctx.store,
        component.metadata.namespace.as_deref(),
        &LabelSelector::everything(),
    )
    .await?;
    for prereq in prereqs {
        let mut of_kind = siblings
            .iter()
            .filter(|c| &c.spec.kind == prereq && !c.metadata.is_deleting())
            .peekable();
        if of_kind.peek().is_none() || !of_kind.all(Component::is_ready) {
            return Ok(Some(prereq.clone()));
        }
    }
    Ok(None)
}

async fn load_set(ctx: &Context, component: &Component, name: Option<&str>) -> Result<Option<InstallerSet>> {
    match name {
        Some(name) => {
            ctx.installer_sets
                .get(component.metadata.namespace.as_deref(), name)
                .await
        }
        None => Ok(None),
    }
}

async fn converge(ctx: &Context, component: Component) -> Result<Action> {
    let name = component.metadata.name.clone();
    let generation = component.metadata.generation;
    let mut status = component.status.clone().unwrap_or_default();

    let Some(strategy) = ctx.strategy(&component.spec.kind) else {
        let err = Error::validation_for_field(
            &name,
            "spec.kind",
            format!("unknown component kind {:?}", component.spec.kind.as_str()),
        );
        warn!(component = %component.key(), error = %err, "rejecting component");
        mark_terminal(&mut status, &err, generation);
        write_status(ctx, &component, &status).await?;
        return Ok(Action::AwaitChange);
    };

    let versions = ctx.source.supported_versions(&component.spec.kind);
    let vctx = ctx.validation_context(&name, strategy.as_ref(), &versions);
    let spec = ctx.defaulter.apply_defaults(&component.spec, &vctx);
    if let Err(err) = ctx.validator.validate(&spec, &vctx) {
        warn!(component = %component.key(), error = %err, "spec invalid");
        mark_terminal(&mut status, &err, generation);
        write_status(ctx, &component, &status).await?;
        return Ok(Action::AwaitChange);
    }
    status.conditions.mark_true(SPEC_VALID, "Valid", "spec is valid");

    if let Some(blocker) = blocking_prerequisite(ctx, &component).await? {
        let message = format!("{blocker} not ready");
        debug!(component = %component.key(), %blocker, "waiting on prerequisite");
        status.phase = ComponentPhase::Waiting;
        status
            .conditions
            .mark_false(DEPENDENCIES_READY, "DependencyNotReady", message.as_str());
        status.conditions.mark_false(READY, "DependencyNotReady", message);
        write_status(ctx, &component, &status).await?;
        return Ok(Action::Requeue(ctx.config.not_ready_poll));
    }
    status
        .conditions
        .mark_true(DEPENDENCIES_READY, "DependenciesReady", "all prerequisites are ready");

    let rendered = match render(&*ctx.source, &name, &spec) {
        Ok(r) => r,
        Err(err) if !err.is_retryable() => {
            warn!(component = %component.key(), error = %err, "cannot render manifests");
            mark_terminal(&mut status, &err, generation);
            write_status(ctx, &component, &status).await?;
            return Ok(Action::AwaitChange);
        }
        Err(err) => return Err(err),
    };
    let bundle = Bundle {
        version: spec.version.clone(),
        hash: rendered.hash,
        items: rendered.items,
    };

    let active = load_set(ctx, &component, status.active_installer_set.as_deref()).await?;
    let retained = load_set(ctx, &component, status.retained_installer_set.as_deref()).await?;

    // A rolled-back hash is not retried until the inputs change.
    if status.failed_hash.as_deref() == Some(bundle.hash.as_str()) {
        if let Some(active) = &active {
            ctx.installer_sets.converge(active).await?;
        }
        status.phase = ComponentPhase::Error;
        status.observed_generation = generation;
        write_status(ctx, &component, &status).await?;
        return Ok(Action::AwaitChange);
    }
    status.failed_hash = None;

    let (active, mut retained) = select_sets(ctx, &component, &bundle, active, retained).await?;
    let converged = ctx.installer_sets.converge(&active).await?;
    let mut active = converged.set;
    let mut retry_after = converged.retry_after;
    let mut failure: Option<(String, String)> = None;

    if active.is_ready() {
        if let Some(old) = retained.take() {
            info!(component = %component.key(), from = %old.metadata.name, to = %active.metadata.name, "upgrade complete");
            ctx.installer_sets.supersede(&old, &active).await?;
        }
    } else if let Some((detail, reason)) = threshold_failure(ctx, &active) {
        match retained.take() {
            Some(old) => {
                let failed_hash = active.spec.hash.clone();
                let restored = ctx.installer_sets.rollback(&active, &old).await?;
                warn!(component = %component.key(), failed = %active.metadata.name, restored = %restored.set.metadata.name, "upgrade rolled back");
                status.failed_hash = Some(failed_hash);
                failure = Some((
                    "UpgradeRolledBack".to_string(),
                    format!("upgrade to {} rolled back; {detail}", bundle.version),
                ));
                active = restored.set;
                retry_after = None;
            }
            None => failure = Some((reason, detail)),
        }
    }

    if retained.is_none() {
        collect_stale_sets(ctx, &component, &active).await?;
    }

    status.active_installer_set = Some(active.metadata.name.clone());
    status.active_hash = Some(active.spec.hash.clone());
    status.version = Some(active.spec.version.clone());
    status.retained_installer_set = retained.as_ref().map(|r| r.metadata.name.clone());
    copy_set_condition(&mut status, &active);

    status.phase = match (&failure, active.is_ready(), &retained) {
        (Some(_), _, _) => ComponentPhase::Error,
        (None, true, _) => ComponentPhase::Ready,
        (None, false, Some(_)) => ComponentPhase::Upgrading,
        (None, false, None) => ComponentPhase::Installing,
    };
    match &failure {
        Some((reason, message)) => {
            status.conditions.mark_false(READY, reason.as_str(), message.as_str());
        }
        None if status.phase == ComponentPhase::Upgrading => {
            let message = format!(
                "rolling out {}; {} kept until it is ready",
                active.spec.version,
                retained.as_ref().map(|r| r.metadata.name.as_str()).unwrap_or_default()
            );
            status.conditions.mark_false(READY, "Upgrading", message);
        }
        None => {
            status
                .conditions
                .aggregate(READY, &[SPEC_VALID, DEPENDENCIES_READY, INSTALLER_SET_READY]);
        }
    }
    status.observed_generation = generation;

    let phase = status.phase;
    write_status(ctx, &component, &status).await?;
    Ok(match phase {
        ComponentPhase::Ready => Action::AwaitChange,
        ComponentPhase::Error if status.failed_hash.is_some() => Action::AwaitChange,
        _ => Action::Requeue(poll_delay(retry_after, ctx.config.not_ready_poll)),
    })
}

/// Description and reason of the item that pushed `set` past the rollout threshold.
fn threshold_failure(ctx: &Context, set: &InstallerSet) -> Option<(String, String)> {
    ctx.installer_sets.past_threshold(set).map(|(item, st)| {
        (
            format!("{item}: {}", st.message.as_deref().unwrap_or("apply failed")),
            st.reason.clone().unwrap_or_else(|| "ManifestApplyError".to_string()),
        )
    })
}

fn poll_delay(retry_after: Option<Duration>, poll: Duration) -> Duration {
    retry_after.map_or(poll, |d| d.min(poll))
}

/// Pick the set to converge this pass and the rollback target (if any),
/// creating the desired set when needed.
async fn select_sets(
    ctx: &Context,
    component: &Component,
    bundle: &Bundle,
    active: Option<InstallerSet>,
    retained: Option<InstallerSet>,
) -> Result<(InstallerSet, Option<InstallerSet>)> {
    let sets = &ctx.installer_sets;
    match (active, retained) {
        (Some(active), retained) if active.spec.hash == bundle.hash => Ok((active, retained)),
        // spec reverted mid-upgrade: go back to the retained set
        (Some(active), Some(retained)) if retained.spec.hash == bundle.hash => {
            info!(component = %component.key(), dropped = %active.metadata.name, "upgrade reverted");
            sets.delete(&active, Some(&retained)).await?;
            Ok((retained, None))
        }
        // spec changed again mid-upgrade: replace the in-flight set, keep the rollback target
        (Some(active), Some(retained)) => {
            let next = sets.create_or_update(component, bundle).await?;
            sets.delete(&active, Some(&next)).await?;
            Ok((next, Some(retained)))
        }
        (Some(active), None) => {
            let next = sets.create_or_update(component, bundle).await?;
            if active.is_ready() {
                info!(component = %component.key(), from = %active.metadata.name, to = %next.metadata.name, "upgrading");
                Ok((next, Some(active)))
            } else {
                // nothing to roll back to
                sets.delete(&active, Some(&next)).await?;
                Ok((next, None))
            }
        }
        (None, retained) => Ok((sets.create_or_update(component, bundle).await?, retained)),
    }
}

/// Remove sets owned by the component that are no longer referenced.
async fn collect_stale_sets(ctx: &Context, component: &Component, active: &InstallerSet) -> Result<()> {
    for set in ctx.installer_sets.list_for(component).await? {
        if set.metadata.name != active.metadata.name {
            info!(component = %component.key(), installer_set = %set.metadata.name, "removing stale installer set");
            ctx.installer_sets.delete(&set, Some(active)).await?;
        }
    }
    Ok(())
}

fn copy_set_condition(status: &mut ComponentStatus, set: &InstallerSet) {
    let ready = set
        .status
        .as_ref()
        .and_then(|s| s.conditions.get(READY))
        .cloned();
    match ready {
        Some(c) => {
            status.conditions.set(Condition {
                type_: INSTALLER_SET_READY.to_string(),
                ..c
            });
        }
        None => {
            status.conditions.mark_unknown(
                INSTALLER_SET_READY,
                "Pending",
                format!("{} has not reported", set.metadata.name),
            );
        }
    }
}

/// Tear down every owned installer set, then release the finalizer.
///
/// Waits while a component depending on this one still exists in the same
/// namespace, so teardown runs in reverse dependency order.
async fn finalize(ctx: &Context, component: Component) -> Result<Action> {
    if !component.metadata.has_finalizer(FINALIZER) {
        return Ok(Action::AwaitChange);
    }
    let mut status = component.status.clone().unwrap_or_default();
    status.phase = ComponentPhase::Deleting;

    let dependents = ctx.graph.dependents(&component.spec.kind);
    if !dependents.is_empty() {
        let siblings: Vec<Component> = typed::list(
            &*ctx.store,
            component.metadata.namespace.as_deref(),
            &LabelSelector::everything(),
        )
        .await?;
        let blocking: Vec<&str> = siblings
            .iter()
            .filter(|c| dependents.contains(&c.spec.kind))
            .map(|c| c.metadata.name.as_str())
            .collect();
        if !blocking.is_empty() {
            let message = format!("waiting for dependents to be removed: {}", blocking.join(", "));
            debug!(component = %component.key(), %message);
            status.conditions.mark_false(READY, "Deleting", message);
            write_status(ctx, &component, &status).await?;
            return Ok(Action::Requeue(ctx.config.not_ready_poll));
        }
    }

    status
        .conditions
        .mark_false(READY, "Deleting", "removing installer sets");
    let mut component = write_status(ctx, &component, &status).await?;

    let mut removed = 0;
    for set in ctx.installer_sets.list_for(&component).await? {
        removed += ctx.installer_sets.delete(&set, None).await?;
    }
    info!(component = %component.key(), removed, "component resources removed");

    component.metadata.finalizers.retain(|f| f != FINALIZER);
    typed::update(&*ctx.store, &component).await?;
    Ok(Action::AwaitChange)
}
