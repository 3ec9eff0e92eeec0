use serde::{Deserialize, Serialize};

use crate::model::SettingValue;

/// Expression language for `value`, `resolve` and `limit_to_extruder`
/// properties in the setting schema.
///
/// Expressions are stored as data in definition files and evaluated against
/// a stack by `logic::resolve`. The language is deliberately small: setting
/// references, arithmetic, boolean combinators and reductions over the
/// per-extruder values of a setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    Lit {
        value: SettingValue,
    },
    /// Value of another setting, resolved on the stack being queried.
    Ref {
        key: String,
    },
    /// The values of a setting across all enabled extruder stacks, as a list.
    ExtruderValues {
        key: String,
    },
    Any {
        of: Box<Expr>,
    },
    All {
        of: Box<Expr>,
    },
    Sum {
        of: Box<Expr>,
    },
    Min {
        of: Box<Expr>,
    },
    Max {
        of: Box<Expr>,
    },
    Count {
        of: Box<Expr>,
    },
    Add {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Sub {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Mul {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Div {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not {
        of: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Eq {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Gt {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Lt {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        r#else: Box<Expr>,
    },
}

impl Expr {
    pub fn lit(value: impl Into<SettingValue>) -> Self {
        Expr::Lit {
            value: value.into(),
        }
    }

    pub fn reference(key: impl Into<String>) -> Self {
        Expr::Ref { key: key.into() }
    }

    pub fn extruder_values(key: impl Into<String>) -> Self {
        Expr::ExtruderValues { key: key.into() }
    }

    pub fn any(of: Expr) -> Self {
        Expr::Any { of: Box::new(of) }
    }

    pub fn all(of: Expr) -> Self {
        Expr::All { of: Box::new(of) }
    }

    pub fn sum(of: Expr) -> Self {
        Expr::Sum { of: Box::new(of) }
    }

    pub fn min(of: Expr) -> Self {
        Expr::Min { of: Box::new(of) }
    }

    pub fn max(of: Expr) -> Self {
        Expr::Max { of: Box::new(of) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_json_shape() {
        let expr = Expr::any(Expr::extruder_values("support_enable"));
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "op": "any",
                "of": {"op": "extruder_values", "key": "support_enable"}
            })
        );
        let back: Expr = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn literal_carries_typed_value() {
        let expr = Expr::lit(0.2);
        let json = serde_json::to_string(&expr).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
    }
}
