//! Stack orchestrator: owns one child component per enabled kind, created in
//! dependency order and gated on prerequisite readiness, and aggregates their
//! readiness into the stack's own status.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use keel_core::conditions::{COMPONENTS_READY, READY, SPEC_VALID};
use keel_core::{
    labels, Component, ComponentKind, ComponentPhase, ComponentSpec, ComponentSummary, Error,
    LabelSelector, Object, ObjectKey, ObjectMeta, Result, Stack, StackStatus, FINALIZER,
};
use keel_kubehub::typed;

use crate::{Action, Context};

/// Name of the component a stack creates for `kind`.
pub fn child_name(kind: &ComponentKind) -> String {
    kind.to_string()
}

pub async fn reconcile_stack(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let Some(stack) = typed::get::<Stack>(&*ctx.store, key).await? else {
        debug!(stack = %key, "stack gone");
        return Ok(Action::AwaitChange);
    };
    if stack.metadata.is_deleting() {
        return teardown(ctx, stack).await;
    }
    let stack = if stack.metadata.has_finalizer(FINALIZER) {
        stack
    } else {
        let mut stack = stack;
        stack.metadata.finalizers.push(FINALIZER.to_string());
        typed::update(&*ctx.store, &stack).await?
    };
    orchestrate(ctx, stack).await
}

/// Children this stack owns, by kind.
async fn children(ctx: &Context, stack: &Stack) -> Result<BTreeMap<ComponentKind, Component>> {
    let selector = LabelSelector::everything().with(labels::STACK, stack.metadata.name.as_str());
    let owned: Vec<Component> =
        typed::list(&*ctx.store, stack.metadata.namespace.as_deref(), &selector).await?;
    Ok(owned
        .into_iter()
        .filter(|c| c.metadata.name == child_name(&c.spec.kind))
        .map(|c| (c.spec.kind.clone(), c))
        .collect())
}

async fn write_status(ctx: &Context, stack: &Stack, status: &StackStatus) -> Result<()> {
    if stack.status.as_ref() == Some(status) {
        return Ok(());
    }
    debug!(stack = %stack.key(), ready = status.conditions.is_true(READY), "writing stack status");
    typed::replace_status(&*ctx.store, stack, &serde_json::to_value(status)?).await?;
    Ok(())
}

/// Kinds named in the spec must be known, and an enabled kind may not
/// depend on a disabled one.
fn validate(ctx: &Context, stack: &Stack) -> Result<()> {
    for kind in stack.spec.components.keys() {
        if !ctx.graph.contains(kind) {
            return Err(Error::validation_for_field(
                &stack.metadata.name,
                format!("spec.components.{kind}"),
                format!("unknown component kind {kind}"),
            ));
        }
    }
    for kind in ctx.graph.topo_order() {
        if !stack.spec.is_enabled(kind) {
            continue;
        }
        for prereq in ctx.graph.transitive_prerequisites(kind) {
            if !stack.spec.is_enabled(&prereq) {
                return Err(Error::validation_for_field(
                    &stack.metadata.name,
                    format!("spec.components.{prereq}"),
                    format!("{kind} requires {prereq}, which is not enabled"),
                ));
            }
        }
    }
    Ok(())
}

fn desired_child(stack: &Stack, kind: &ComponentKind) -> Component {
    let entry = stack.spec.components.get(kind).cloned().unwrap_or_default();
    let spec = ComponentSpec {
        kind: kind.clone(),
        version: entry.version,
        target_namespace: stack.spec.target_namespace.clone(),
        config: entry.config,
    };
    let mut child = Component::new(&child_name(kind), stack.metadata.namespace.as_deref(), spec);
    child.metadata.labels = [
        (labels::MANAGED_BY, labels::MANAGED_BY_VALUE),
        (labels::STACK, stack.metadata.name.as_str()),
        (labels::COMPONENT_KIND, kind.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    if let Some(uid) = &stack.metadata.uid {
        child.metadata.extra.insert(
            "ownerReferences".into(),
            serde_json::json!([{
                "apiVersion": Stack::API_VERSION,
                "kind": Stack::KIND,
                "name": stack.metadata.name,
                "uid": uid,
                "controller": true,
                "blockOwnerDeletion": true,
            }]),
        );
    }
    child
}

fn summarize(child: &Component) -> ComponentSummary {
    let ready = child
        .status
        .as_ref()
        .and_then(|s| s.conditions.get(READY).cloned());
    ComponentSummary {
        phase: child.phase(),
        ready: child.is_ready(),
        reason: ready.as_ref().map(|c| c.reason.clone()).unwrap_or_else(|| "Pending".into()),
        message: ready
            .map(|c| c.message)
            .unwrap_or_else(|| "component has not reported".into()),
    }
}

async fn orchestrate(ctx: &Context, stack: Stack) -> Result<Action> {
    let mut status = stack.status.clone().unwrap_or_default();
    status.observed_generation = stack.metadata.generation;

    if let Err(err) = validate(ctx, &stack) {
        warn!(stack = %stack.key(), error = %err, "stack spec invalid");
        status.conditions.mark_false(SPEC_VALID, err.reason(), err.to_string());
        status.conditions.mark_false(READY, err.reason(), err.to_string());
        write_status(ctx, &stack, &status).await?;
        return Ok(Action::AwaitChange);
    }
    status.conditions.mark_true(SPEC_VALID, "Valid", "spec is valid");

    let mut children = children(ctx, &stack).await?;
    let mut summaries: BTreeMap<ComponentKind, ComponentSummary> = BTreeMap::new();

    // Disabled kinds go first, dependents before prerequisites.
    for kind in ctx.graph.reverse_order() {
        if stack.spec.is_enabled(kind) {
            continue;
        }
        if let Some(child) = children.remove(kind) {
            if !child.metadata.is_deleting() {
                info!(stack = %stack.key(), kind = %kind, "removing disabled component");
                typed::delete(&*ctx.store, &child).await?;
            }
        }
    }

    for kind in ctx.graph.topo_order() {
        if !stack.spec.is_enabled(kind) {
            continue;
        }
        let blocker = ctx
            .graph
            .prerequisites(kind)
            .iter()
            .find(|p| !summaries.get(*p).is_some_and(|s| s.ready));
        if let Some(blocker) = blocker {
            let existing = children.get(kind);
            summaries.insert(
                kind.clone(),
                ComponentSummary {
                    phase: existing.map(Component::phase).unwrap_or(ComponentPhase::Waiting),
                    ready: false,
                    reason: "DependencyNotReady".into(),
                    message: format!("{blocker} not ready"),
                },
            );
            continue;
        }

        let desired = desired_child(&stack, kind);
        let child = match children.remove(kind) {
            None => match typed::get::<Component>(&*ctx.store, &desired.key()).await? {
                // same name, not ours
                Some(foreign) => {
                    summaries.insert(
                        kind.clone(),
                        ComponentSummary {
                            phase: foreign.phase(),
                            ready: false,
                            reason: "NameConflict".into(),
                            message: format!("component {} is not owned by this stack", foreign.metadata.name),
                        },
                    );
                    continue;
                }
                None => {
                    info!(stack = %stack.key(), kind = %kind, "creating component");
                    typed::create(&*ctx.store, &desired).await?
                }
            },
            Some(mut child) if child.spec != desired.spec => {
                info!(stack = %stack.key(), kind = %kind, "updating component spec");
                child.spec = desired.spec;
                typed::update(&*ctx.store, &child).await?
            }
            Some(child) => child,
        };
        summaries.insert(kind.clone(), summarize(&child));
    }

    let enabled = summaries.len();
    let not_ready = ctx
        .graph
        .topo_order()
        .iter()
        .find_map(|k| summaries.get(k).filter(|s| !s.ready).map(|s| (k, s)));
    let all_ready = not_ready.is_none();
    match not_ready {
        Some((kind, s)) => {
            status.conditions.mark_false(
                COMPONENTS_READY,
                s.reason.as_str(),
                format!("{kind}: {}", s.message),
            );
        }
        None => {
            status.conditions.mark_true(
                COMPONENTS_READY,
                "AllComponentsReady",
                format!("{enabled} components ready"),
            );
        }
    }
    status.conditions.aggregate(READY, &[SPEC_VALID, COMPONENTS_READY]);
    status.components = summaries;
    write_status(ctx, &stack, &status).await?;

    Ok(if all_ready {
        Action::AwaitChange
    } else {
        Action::Requeue(ctx.config.not_ready_poll)
    })
}

/// Delete children in reverse dependency order, one kind at a time, then
/// release the stack's finalizer.
async fn teardown(ctx: &Context, stack: Stack) -> Result<Action> {
    if !stack.metadata.has_finalizer(FINALIZER) {
        return Ok(Action::AwaitChange);
    }
    let children = children(ctx, &stack).await?;
    for kind in ctx.graph.reverse_order() {
        let Some(child) = children.get(kind) else {
            continue;
        };
        if !child.metadata.is_deleting() {
            info!(stack = %stack.key(), kind = %kind, "deleting component");
            typed::delete(&*ctx.store, child).await?;
        }
        let mut status = stack.status.clone().unwrap_or_default();
        status.conditions.mark_false(
            READY,
            "Deleting",
            format!("waiting for {} to be removed", child.metadata.name),
        );
        write_status(ctx, &stack, &status).await?;
        return Ok(Action::Requeue(ctx.config.not_ready_poll));
    }

    let mut stack = stack;
    stack.metadata.finalizers.retain(|f| f != FINALIZER);
    typed::update(&*ctx.store, &stack).await?;
    info!(stack = %stack.key(), "stack removed");
    Ok(Action::AwaitChange)
}

/// Key of the stack owning `component`, if any.
pub fn owning_stack(component: &ObjectMeta) -> Option<ObjectKey> {
    component
        .labels
        .get(labels::STACK)
        .map(|name| ObjectKey::new(component.namespace.as_deref(), name.as_str()))
}
