use std::cell::RefCell;
use std::collections::HashSet;

use crate::model::{
    DefinitionContainer, ExtruderStack, Expr, GlobalStack, Id, ProfileStack, SettingValue, Slot,
    StackError,
};
use crate::store::registry::{ContainerRegistry, StackEntry};

thread_local! {
    /// Setting keys whose resolve expression is being evaluated on this
    /// thread. A nested query for the same key skips the resolve and falls
    /// through to the plain value, which terminates cyclic resolves.
    static RESOLVING: RefCell<HashSet<String>> = RefCell::new(HashSet::new());

    /// Depth guard for value-expression evaluation; a schema with a cyclic
    /// value graph yields None instead of overflowing the stack.
    static EVAL_DEPTH: RefCell<u32> = const { RefCell::new(0) };
}

const MAX_EVAL_DEPTH: u32 = 100;

/// Traversal state carried through one property query.
#[derive(Debug, Default, Clone)]
pub struct PropertyContext {
    /// Stack ids visited so far, outermost first.
    pub trail: Vec<Id>,
    /// Skip slots above this one when walking; used to read raw values
    /// beneath an overriding container.
    pub evaluate_from_slot: Option<Slot>,
    /// Cached limit_to_extruder answer for the current query.
    extruder_position: Option<i64>,
}

impl PropertyContext {
    pub fn starting_at(slot: Slot) -> Self {
        Self {
            evaluate_from_slot: Some(slot),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    Global(&'a GlobalStack),
    Extruder(&'a ExtruderStack, &'a GlobalStack),
}

/// Read-only resolver over the registry arena.
///
/// All queries are deterministic for fixed container contents; nothing here
/// mutates the registry.
pub struct SettingLookup<'a> {
    registry: &'a ContainerRegistry,
    /// Position substituted for -1 when a setting's value names an extruder.
    pub default_extruder_position: usize,
}

impl<'a> SettingLookup<'a> {
    pub fn new(registry: &'a ContainerRegistry) -> Self {
        Self {
            registry,
            default_extruder_position: 0,
        }
    }

    pub fn with_default_extruder(registry: &'a ContainerRegistry, position: usize) -> Self {
        Self {
            registry,
            default_extruder_position: position,
        }
    }

    /// Resolve a property on any registered stack. Errors (an orphaned
    /// extruder) are logged and reported as "not set".
    pub fn property(&self, stack_id: &str, key: &str, property: &str) -> Option<SettingValue> {
        let mut ctx = PropertyContext::default();
        match self.registry.stack(stack_id)? {
            StackEntry::Global(global) => self.global_property(global, key, property, &mut ctx),
            StackEntry::Extruder(extruder) => {
                match self.extruder_property(extruder, key, property, &mut ctx) {
                    Ok(result) => result,
                    Err(err) => {
                        log::warn!("property lookup failed on {}: {}", stack_id, err);
                        None
                    }
                }
            }
            StackEntry::Generic(stack) => self.generic_property(stack, key, property),
        }
    }

    /// The machine-level query: resolve short-circuit, limit_to_extruder
    /// redirection, then the plain slot walk.
    pub fn global_property(
        &self,
        global: &GlobalStack,
        key: &str,
        property: &str,
        ctx: &mut PropertyContext,
    ) -> Option<SettingValue> {
        let definition = self.registry.definition(global.profile.definition_id())?;
        if !definition.contains_key(key) {
            return None;
        }
        ctx.trail.push(global.id().clone());
        let scope = Scope::Global(global);

        if self.should_resolve(&global.profile, definition, key, property) {
            RESOLVING.with(|r| r.borrow_mut().insert(key.to_string()));
            let resolved = self.walk(&global.profile, scope, key, "resolve", ctx);
            RESOLVING.with(|r| {
                r.borrow_mut().remove(key);
            });
            if resolved.is_some() {
                ctx.trail.pop();
                return resolved;
            }
        }

        let limit = self
            .walk(&global.profile, scope, key, "limit_to_extruder", ctx)
            .and_then(|v| v.as_int())
            .unwrap_or(-1);
        if limit >= 0 {
            if let Some(extruder) = global
                .extruders
                .get(&(limit as usize))
                .and_then(|id| self.registry.extruder_stack(id))
            {
                let settable = self
                    .walk(&global.profile, scope, key, "settable_per_extruder", ctx)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let redirected = if settable {
                    self.extruder_property(extruder, key, property, ctx)
                        .ok()
                        .flatten()
                } else {
                    // Schema inconsistency; answer from the named extruder's
                    // own slots without re-entering its delegation logic.
                    log::warn!(
                        "setting {} has limit_to_extruder but is not settable per extruder",
                        key
                    );
                    self.walk(
                        &extruder.profile,
                        Scope::Extruder(extruder, global),
                        key,
                        property,
                        ctx,
                    )
                };
                if redirected.is_some() {
                    ctx.trail.pop();
                    return redirected;
                }
            }
        }

        let result = self.walk(&global.profile, scope, key, property, ctx);
        ctx.trail.pop();
        result
    }

    /// The extruder-level query: bypass for non-per-extruder settings,
    /// limit_to_extruder redirection, then this stack's slots with
    /// fall-through to the global stack.
    pub fn extruder_property(
        &self,
        extruder: &ExtruderStack,
        key: &str,
        property: &str,
        ctx: &mut PropertyContext,
    ) -> Result<Option<SettingValue>, StackError> {
        let global_id = extruder.require_next_stack()?.clone();
        let global = self
            .registry
            .global_stack(&global_id)
            .ok_or_else(|| StackError::NoGlobalStack(extruder.id().clone()))?;
        ctx.trail.push(extruder.id().clone());
        let scope = Scope::Extruder(extruder, global);

        let settable = self
            .walk_chain(
                &[&extruder.profile, &global.profile],
                scope,
                key,
                "settable_per_extruder",
                ctx,
            )
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !settable {
            let result = self.global_property(global, key, property, ctx);
            ctx.trail.pop();
            return Ok(result);
        }

        if ctx.extruder_position.is_none() {
            ctx.extruder_position = Some(
                self.walk_chain(
                    &[&extruder.profile, &global.profile],
                    scope,
                    key,
                    "limit_to_extruder",
                    ctx,
                )
                .and_then(|v| v.as_int())
                .unwrap_or(-1),
            );
        }
        let limit = ctx.extruder_position.unwrap_or(-1);
        if limit >= 0 && limit as usize != extruder.position() {
            if let Some(other_id) = global.extruders.get(&(limit as usize)) {
                if let Some(other) = self.registry.extruder_stack(other_id) {
                    if other.id() != extruder.id() {
                        if let Ok(Some(result)) = self.extruder_property(other, key, property, ctx)
                        {
                            ctx.trail.pop();
                            return Ok(Some(result));
                        }
                    }
                }
            }
        }

        // On a miss the lookup falls off this stack into a plain walk of the
        // global slots; re-entering the global delegation logic here would
        // bounce straight back via limit_to_extruder.
        let result = self
            .walk(&extruder.profile, scope, key, property, ctx)
            .or_else(|| self.walk(&global.profile, Scope::Global(global), key, property, ctx));
        ctx.trail.pop();
        Ok(result)
    }

    /// Translate a -1 extruder-position value to the default extruder.
    pub fn extruder_position_value_with_default(&self, global: &GlobalStack, key: &str) -> usize {
        let mut ctx = PropertyContext::default();
        match self
            .global_property(global, key, "value", &mut ctx)
            .and_then(|v| v.as_int())
        {
            Some(position) if position >= 0 => position as usize,
            _ => self.default_extruder_position,
        }
    }

    /// A setting has a user value when user-changes or quality-changes
    /// carries a value for it.
    pub fn has_user_value(&self, profile: &ProfileStack, key: &str) -> bool {
        [Slot::UserChanges, Slot::QualityChanges].iter().any(|slot| {
            self.registry
                .instance(profile.slot(*slot))
                .map(|c| c.has_property(key, "value"))
                .unwrap_or(false)
        })
    }

    fn should_resolve(
        &self,
        profile: &ProfileStack,
        definition: &DefinitionContainer,
        key: &str,
        property: &str,
    ) -> bool {
        if property != "value" {
            return false;
        }
        if definition
            .setting(key)
            .and_then(|s| s.resolve.as_ref())
            .is_none()
        {
            return false;
        }
        if RESOLVING.with(|r| r.borrow().contains(key)) {
            return false;
        }
        // An explicit user value beats any resolve.
        !self.has_user_value(profile, key)
    }

    fn generic_property(
        &self,
        stack: &crate::model::ContainerStack,
        key: &str,
        property: &str,
    ) -> Option<SettingValue> {
        for container_id in &stack.containers {
            if let Some(instance) = self.registry.instance(container_id) {
                if let Some(value) = instance.property(key, property) {
                    return Some(value);
                }
            } else if let Some(definition) = self.registry.definition(container_id) {
                if let Some(setting) = definition.setting(key) {
                    if property == "default_value" || property == "value" {
                        return setting.default_value.clone();
                    }
                }
            }
        }
        None
    }

    /// Walk one profile stack's slots from the top down.
    fn walk(
        &self,
        profile: &ProfileStack,
        scope: Scope<'_>,
        key: &str,
        property: &str,
        ctx: &mut PropertyContext,
    ) -> Option<SettingValue> {
        let start = ctx.evaluate_from_slot.map(|s| s.index()).unwrap_or(0);
        for slot in &Slot::ALL[start..] {
            let container_id = profile.slot(*slot);
            if let Some(instance) = self.registry.instance(container_id) {
                if let Some(value) = instance.property(key, property) {
                    return Some(value);
                }
                continue;
            }
            if let Some(definition) = self.registry.definition(container_id) {
                if let Some(value) = self.definition_property(definition, scope, key, property, ctx)
                {
                    return Some(value);
                }
            }
        }
        None
    }

    fn walk_chain(
        &self,
        profiles: &[&ProfileStack],
        scope: Scope<'_>,
        key: &str,
        property: &str,
        ctx: &mut PropertyContext,
    ) -> Option<SettingValue> {
        profiles
            .iter()
            .find_map(|profile| self.walk(profile, scope, key, property, ctx))
    }

    /// Schema-level property of a setting, evaluating expressions where the
    /// schema stores them.
    fn definition_property(
        &self,
        definition: &DefinitionContainer,
        scope: Scope<'_>,
        key: &str,
        property: &str,
        ctx: &mut PropertyContext,
    ) -> Option<SettingValue> {
        let setting = definition.setting(key)?;
        match property {
            "value" => match &setting.value {
                Some(expr) => self
                    .evaluate(expr, scope, ctx)
                    .or_else(|| setting.default_value.clone()),
                None => setting.default_value.clone(),
            },
            "default_value" => setting.default_value.clone(),
            "resolve" => {
                let expr = setting.resolve.as_ref()?;
                self.evaluate(expr, scope, ctx)
            }
            "enabled" => match &setting.enabled {
                Some(expr) => self.evaluate(expr, scope, ctx),
                None => Some(SettingValue::Bool(true)),
            },
            "settable_per_extruder" => Some(SettingValue::Bool(setting.settable_per_extruder)),
            "limit_to_extruder" => match &setting.limit_to_extruder {
                Some(expr) => self.evaluate(expr, scope, ctx),
                None => Some(SettingValue::Int(-1)),
            },
            "type" => Some(SettingValue::Str(setting.setting_type.clone())),
            "minimum_value" => setting.minimum_value.clone(),
            "maximum_value" => setting.maximum_value.clone(),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Expression evaluation

    fn evaluate(
        &self,
        expr: &Expr,
        scope: Scope<'_>,
        ctx: &mut PropertyContext,
    ) -> Option<SettingValue> {
        let too_deep = EVAL_DEPTH.with(|d| {
            let mut depth = d.borrow_mut();
            *depth += 1;
            *depth > MAX_EVAL_DEPTH
        });
        let result = if too_deep {
            log::warn!("expression evaluation exceeded depth limit");
            None
        } else {
            self.evaluate_inner(expr, scope, ctx)
        };
        EVAL_DEPTH.with(|d| *d.borrow_mut() -= 1);
        result
    }

    fn evaluate_inner(
        &self,
        expr: &Expr,
        scope: Scope<'_>,
        ctx: &mut PropertyContext,
    ) -> Option<SettingValue> {
        match expr {
            Expr::Lit { value } => Some(value.clone()),
            Expr::Ref { key } => self.scoped_value(scope, key),
            Expr::ExtruderValues { key } => {
                let global = match scope {
                    Scope::Global(g) => g,
                    Scope::Extruder(_, g) => g,
                };
                Some(SettingValue::List(self.extruder_values(global, key)))
            }
            Expr::Any { of } => self.reduce(of, scope, ctx, |values| {
                SettingValue::Bool(values.iter().any(SettingValue::is_truthy))
            }),
            Expr::All { of } => self.reduce(of, scope, ctx, |values| {
                SettingValue::Bool(values.iter().all(SettingValue::is_truthy))
            }),
            Expr::Count { of } => self.reduce(of, scope, ctx, |values| {
                SettingValue::Int(values.iter().filter(|v| v.is_truthy()).count() as i64)
            }),
            Expr::Sum { of } => self.reduce(of, scope, ctx, |values| {
                numeric_fold(values, 0.0, |acc, v| acc + v)
            }),
            Expr::Min { of } => {
                self.reduce(of, scope, ctx, |values| {
                    numeric_fold(values, f64::INFINITY, f64::min)
                })
            }
            Expr::Max { of } => self.reduce(of, scope, ctx, |values| {
                numeric_fold(values, f64::NEG_INFINITY, f64::max)
            }),
            Expr::Add { left, right } => self.arith(left, right, scope, ctx, |a, b| a + b),
            Expr::Sub { left, right } => self.arith(left, right, scope, ctx, |a, b| a - b),
            Expr::Mul { left, right } => self.arith(left, right, scope, ctx, |a, b| a * b),
            Expr::Div { left, right } => {
                let a = self.evaluate(left, scope, ctx)?.as_float()?;
                let b = self.evaluate(right, scope, ctx)?.as_float()?;
                if b == 0.0 {
                    None
                } else {
                    Some(SettingValue::Float(a / b))
                }
            }
            Expr::Not { of } => Some(SettingValue::Bool(
                !self.evaluate(of, scope, ctx)?.is_truthy(),
            )),
            Expr::And { left, right } => Some(SettingValue::Bool(
                self.evaluate(left, scope, ctx)?.is_truthy()
                    && self.evaluate(right, scope, ctx)?.is_truthy(),
            )),
            Expr::Or { left, right } => Some(SettingValue::Bool(
                self.evaluate(left, scope, ctx)?.is_truthy()
                    || self.evaluate(right, scope, ctx)?.is_truthy(),
            )),
            Expr::Eq { left, right } => {
                let a = self.evaluate(left, scope, ctx)?;
                let b = self.evaluate(right, scope, ctx)?;
                Some(SettingValue::Bool(values_equal(&a, &b)))
            }
            Expr::Gt { left, right } => {
                let a = self.evaluate(left, scope, ctx)?.as_float()?;
                let b = self.evaluate(right, scope, ctx)?.as_float()?;
                Some(SettingValue::Bool(a > b))
            }
            Expr::Lt { left, right } => {
                let a = self.evaluate(left, scope, ctx)?.as_float()?;
                let b = self.evaluate(right, scope, ctx)?.as_float()?;
                Some(SettingValue::Bool(a < b))
            }
            Expr::If { cond, then, r#else } => {
                if self.evaluate(cond, scope, ctx)?.is_truthy() {
                    self.evaluate(then, scope, ctx)
                } else {
                    self.evaluate(r#else, scope, ctx)
                }
            }
        }
    }

    /// A setting reference resolves on the stack the expression lives on.
    ///
    /// References start their own traversal: evaluate_from bounds and the
    /// cached extruder position of the outer query must not leak in.
    fn scoped_value(&self, scope: Scope<'_>, key: &str) -> Option<SettingValue> {
        let mut nested = PropertyContext::default();
        match scope {
            Scope::Global(global) => self.global_property(global, key, "value", &mut nested),
            Scope::Extruder(extruder, _) => self
                .extruder_property(extruder, key, "value", &mut nested)
                .ok()
                .flatten(),
        }
    }

    /// The values of `key` on every enabled extruder within the machine's
    /// extruder count.
    pub fn extruder_values(&self, global: &GlobalStack, key: &str) -> Vec<SettingValue> {
        let count = self.machine_extruder_count(global);
        let mut values = Vec::new();
        for (position, extruder_id) in global.extruders.iter() {
            if *position >= count {
                break;
            }
            let Some(extruder) = self.registry.extruder_stack(extruder_id) else {
                continue;
            };
            if !extruder.is_enabled() {
                continue;
            }
            let mut nested = PropertyContext::default();
            if let Ok(Some(value)) = self.extruder_property(extruder, key, "value", &mut nested) {
                values.push(value);
            }
        }
        values
    }

    pub fn machine_extruder_count(&self, global: &GlobalStack) -> usize {
        let mut ctx = PropertyContext::default();
        self.global_property(global, "machine_extruder_count", "value", &mut ctx)
            .and_then(|v| v.as_int())
            .map(|v| v.max(1) as usize)
            .unwrap_or(1)
    }

    fn reduce<F>(
        &self,
        of: &Expr,
        scope: Scope<'_>,
        ctx: &mut PropertyContext,
        fold: F,
    ) -> Option<SettingValue>
    where
        F: FnOnce(&[SettingValue]) -> SettingValue,
    {
        let value = self.evaluate(of, scope, ctx)?;
        let values = match value {
            SettingValue::List(values) => values,
            single => vec![single],
        };
        Some(fold(&values))
    }

    fn arith<F>(
        &self,
        left: &Expr,
        right: &Expr,
        scope: Scope<'_>,
        ctx: &mut PropertyContext,
        op: F,
    ) -> Option<SettingValue>
    where
        F: FnOnce(f64, f64) -> f64,
    {
        let a = self.evaluate(left, scope, ctx)?;
        let b = self.evaluate(right, scope, ctx)?;
        let result = op(a.as_float()?, b.as_float()?);
        if matches!((&a, &b), (SettingValue::Int(_), SettingValue::Int(_)))
            && result.fract() == 0.0
        {
            Some(SettingValue::Int(result as i64))
        } else {
            Some(SettingValue::Float(result))
        }
    }
}

fn numeric_fold<F>(values: &[SettingValue], init: f64, op: F) -> SettingValue
where
    F: Fn(f64, f64) -> f64,
{
    let folded = values
        .iter()
        .filter_map(SettingValue::as_float)
        .fold(init, op);
    if folded.fract() == 0.0 && folded.is_finite() {
        SettingValue::Int(folded as i64)
    } else {
        SettingValue::Float(folded)
    }
}

fn values_equal(a: &SettingValue, b: &SettingValue) -> bool {
    match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => x == y,
        _ => a.to_string() == b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Container, ContainerType, DefinitionContainer, InstanceContainer, SettingDefinition,
    };

    fn float_setting(default: f64, settable_per_extruder: bool) -> SettingDefinition {
        SettingDefinition {
            setting_type: "float".to_string(),
            default_value: Some(SettingValue::Float(default)),
            settable_per_extruder,
            ..Default::default()
        }
    }

    /// Two-extruder machine: the global definition carries the full schema,
    /// the extruder definitions are empty so lookups fall through.
    fn fixture() -> ContainerRegistry {
        let mut registry = ContainerRegistry::new();

        let mut machine_def = DefinitionContainer::new("test_machine", "Test Machine");
        machine_def.settings.insert(
            "machine_extruder_count".into(),
            SettingDefinition {
                setting_type: "int".to_string(),
                default_value: Some(SettingValue::Int(2)),
                settable_per_extruder: false,
                ..Default::default()
            },
        );
        machine_def
            .settings
            .insert("layer_height".into(), float_setting(0.2, false));
        machine_def.settings.insert(
            "support_enable".into(),
            SettingDefinition {
                setting_type: "bool".to_string(),
                default_value: Some(SettingValue::Bool(false)),
                settable_per_extruder: true,
                ..Default::default()
            },
        );
        machine_def.settings.insert(
            "support_enabled".into(),
            SettingDefinition {
                setting_type: "bool".to_string(),
                default_value: Some(SettingValue::Bool(false)),
                settable_per_extruder: false,
                resolve: Some(Expr::any(Expr::extruder_values("support_enable"))),
                ..Default::default()
            },
        );
        machine_def.settings.insert(
            "material_bed_temperature".into(),
            SettingDefinition {
                setting_type: "float".to_string(),
                default_value: Some(SettingValue::Float(20.0)),
                settable_per_extruder: false,
                limit_to_extruder: Some(Expr::lit(0i64)),
                ..Default::default()
            },
        );
        machine_def.settings.insert(
            "self_referential".into(),
            SettingDefinition {
                setting_type: "float".to_string(),
                default_value: Some(SettingValue::Float(7.0)),
                settable_per_extruder: false,
                resolve: Some(Expr::Add {
                    left: Box::new(Expr::reference("self_referential")),
                    right: Box::new(Expr::lit(1.0)),
                }),
                ..Default::default()
            },
        );
        machine_def.settings.insert(
            "material_diameter".into(),
            SettingDefinition {
                setting_type: "float".to_string(),
                default_value: Some(SettingValue::Float(2.85)),
                settable_per_extruder: true,
                ..Default::default()
            },
        );
        registry.add_container(Container::Definition(machine_def));
        registry.add_container(Container::Definition(DefinitionContainer::new(
            "test_extruder",
            "Test Extruder",
        )));

        let mut global = crate::model::GlobalStack::new("gs", "Printer", "test_machine");
        for position in 0..2usize {
            let id = format!("ext_{position}");
            let mut extruder =
                crate::model::ExtruderStack::new(id.clone(), id.clone(), "test_extruder", position);
            extruder.set_next_stack("gs");
            registry.add_extruder_stack(extruder);
            global.add_extruder(position, id).unwrap();
        }
        registry.add_global_stack(global);
        registry
    }

    fn instance(id: &str, container_type: ContainerType) -> InstanceContainer {
        InstanceContainer::new(id, id, container_type)
    }

    fn set_slot(registry: &mut ContainerRegistry, stack: &str, slot: Slot, container_id: &str) {
        let tag = registry.type_tag(container_id).unwrap();
        registry
            .profile_stack_mut(stack)
            .unwrap()
            .replace(slot, container_id, &tag)
            .unwrap();
    }

    #[test]
    fn fall_through_honours_slot_precedence() {
        let mut registry = fixture();
        let mut variant = instance("variant_0.15", ContainerType::Variant);
        variant.set_property("layer_height", "value", 0.15);
        registry.add_container(Container::Instance(variant));
        let mut quality = instance("quality_0.1", ContainerType::Quality);
        quality.set_property("layer_height", "value", 0.1);
        registry.add_container(Container::Instance(quality));
        set_slot(&mut registry, "gs", Slot::Variant, "variant_0.15");
        set_slot(&mut registry, "gs", Slot::Quality, "quality_0.1");

        let value = |r: &ContainerRegistry| {
            SettingLookup::new(r)
                .property("gs", "layer_height", "value")
                .and_then(|v| v.as_float())
        };
        assert_eq!(value(&registry), Some(0.1));

        // Remove the quality override; the variant answers.
        set_slot(&mut registry, "gs", Slot::Quality, Slot::Quality.empty_id());
        assert_eq!(value(&registry), Some(0.15));
        // Remove the variant too; the definition default answers.
        set_slot(&mut registry, "gs", Slot::Variant, Slot::Variant.empty_id());
        assert_eq!(value(&registry), Some(0.2));
    }

    #[test]
    fn limit_to_extruder_redirects_the_global_query() {
        let mut registry = fixture();
        let mut material_0 = instance("material_60", ContainerType::Material);
        material_0.set_property("material_bed_temperature", "value", 60.0);
        registry.add_container(Container::Instance(material_0));
        let mut material_1 = instance("material_100", ContainerType::Material);
        material_1.set_property("material_bed_temperature", "value", 100.0);
        registry.add_container(Container::Instance(material_1));
        set_slot(&mut registry, "ext_0", Slot::Material, "material_60");
        set_slot(&mut registry, "ext_1", Slot::Material, "material_100");

        let lookup = SettingLookup::new(&registry);
        assert_eq!(
            lookup
                .property("gs", "material_bed_temperature", "value")
                .and_then(|v| v.as_float()),
            Some(60.0)
        );
    }

    #[test]
    fn resolve_aggregates_extruder_values() {
        let mut registry = fixture();
        let mut user_1 = instance("ext_1_user", ContainerType::User);
        user_1.set_property("support_enable", "value", true);
        registry.add_container(Container::Instance(user_1));
        set_slot(&mut registry, "ext_1", Slot::UserChanges, "ext_1_user");

        let lookup = SettingLookup::new(&registry);
        assert_eq!(
            lookup
                .property("gs", "support_enabled", "value")
                .and_then(|v| v.as_bool()),
            Some(true)
        );
    }

    #[test]
    fn user_state_above_definition_skips_the_resolve() {
        let mut registry = fixture();
        let mut user_1 = instance("ext_1_user", ContainerType::User);
        user_1.set_property("support_enable", "value", true);
        registry.add_container(Container::Instance(user_1));
        set_slot(&mut registry, "ext_1", Slot::UserChanges, "ext_1_user");

        let mut global_user = instance("gs_user", ContainerType::User);
        global_user.set_property("support_enabled", "value", false);
        registry.add_container(Container::Instance(global_user));
        set_slot(&mut registry, "gs", Slot::UserChanges, "gs_user");

        let lookup = SettingLookup::new(&registry);
        assert_eq!(
            lookup
                .property("gs", "support_enabled", "value")
                .and_then(|v| v.as_bool()),
            Some(false)
        );
    }

    #[test]
    fn cyclic_resolve_terminates_via_the_thread_guard() {
        let registry = fixture();
        let lookup = SettingLookup::new(&registry);
        // The resolve references its own key; the nested lookup skips the
        // resolve and falls through to the default, so 7 + 1.
        assert_eq!(
            lookup
                .property("gs", "self_referential", "value")
                .and_then(|v| v.as_float()),
            Some(8.0)
        );
    }

    #[test]
    fn non_settable_keys_bypass_the_extruder_stack() {
        let mut registry = fixture();
        let mut user_0 = instance("ext_0_user", ContainerType::User);
        // A bogus per-extruder override of a global-only setting.
        user_0.set_property("layer_height", "value", 0.05);
        registry.add_container(Container::Instance(user_0));
        set_slot(&mut registry, "ext_0", Slot::UserChanges, "ext_0_user");

        let lookup = SettingLookup::new(&registry);
        assert_eq!(
            lookup
                .property("ext_0", "layer_height", "value")
                .and_then(|v| v.as_float()),
            Some(0.2)
        );
    }

    #[test]
    fn evaluate_from_slot_reads_raw_values_beneath_overrides() {
        let mut registry = fixture();
        let mut material = instance("material_175", ContainerType::Material);
        material.set_property("material_diameter", "value", 1.75);
        registry.add_container(Container::Instance(material));
        set_slot(&mut registry, "ext_0", Slot::Material, "material_175");

        let lookup = SettingLookup::new(&registry);
        let extruder = registry.extruder_stack("ext_0").unwrap();
        let mut ctx = PropertyContext::default();
        assert_eq!(
            lookup
                .extruder_property(extruder, "material_diameter", "value", &mut ctx)
                .unwrap()
                .and_then(|v| v.as_float()),
            Some(1.75)
        );
        // Starting beneath the material slot skips the override.
        let mut ctx = PropertyContext::starting_at(Slot::Variant);
        assert_eq!(
            lookup
                .extruder_property(extruder, "material_diameter", "value", &mut ctx)
                .unwrap()
                .and_then(|v| v.as_float()),
            Some(2.85)
        );
    }

    #[test]
    fn unknown_keys_resolve_to_none() {
        let registry = fixture();
        let lookup = SettingLookup::new(&registry);
        assert_eq!(lookup.property("gs", "no_such_setting", "value"), None);
    }

    #[test]
    fn orphaned_extruder_reports_no_global_stack() {
        let mut registry = ContainerRegistry::new();
        registry.add_container(Container::Definition(DefinitionContainer::new(
            "test_extruder",
            "Test Extruder",
        )));
        let extruder =
            crate::model::ExtruderStack::new("lonely", "Lonely", "test_extruder", 0);
        registry.add_extruder_stack(extruder);
        let lookup = SettingLookup::new(&registry);
        let extruder = registry.extruder_stack("lonely").unwrap();
        let mut ctx = PropertyContext::default();
        assert!(matches!(
            lookup.extruder_property(extruder, "layer_height", "value", &mut ctx),
            Err(StackError::NoGlobalStack(_))
        ));
    }
}
