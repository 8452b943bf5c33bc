//! The cached compiler must be observably identical to the reference
//! renderer for every tree and dialect.

use keel_core::{DialectProfile, SqlType, Value};
use keel_query::{Column, Compiler, Expr, Select, Table, compile, shape_key};
use proptest::prelude::*;

fn columns() -> Vec<Column> {
    let person = Table::new("person");
    let pet = Table::new("pet").alias("p");
    vec![
        person.typed("id", SqlType::Int),
        person.typed("name", SqlType::Text),
        person.column("order"),
        pet.typed("age", SqlType::Int),
        pet.column("kind"),
    ]
}

fn arb_column() -> impl Strategy<Value = Column> {
    (0..columns().len()).prop_map(|i| columns()[i].clone())
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-100i64..=100).prop_map(Value::Int),
        "[a-z0-9]{0,5}".prop_map(Value::Text),
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
    ]
}

fn arb_dialect() -> impl Strategy<Value = DialectProfile> {
    prop_oneof![
        Just(DialectProfile::sqlite()),
        Just(DialectProfile::postgres()),
        Just(DialectProfile::mysql()),
    ]
}

fn arb_predicate() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (arb_column(), 0..6usize, arb_value()).prop_map(|(col, op, v)| {
            let rhs = Expr::Param(v);
            match op {
                0 => col.eq(rhs),
                1 => col.ne(rhs),
                2 => col.lt(rhs),
                3 => col.le(rhs),
                4 => col.gt(rhs),
                _ => col.ge(rhs),
            }
        }),
        arb_column().prop_map(Column::is_null),
        (arb_column(), prop::collection::vec(arb_value(), 0..=3)).prop_map(|(col, vs)| {
            col.in_list(vs.into_iter().map(Expr::Param).collect())
        }),
        (arb_column(), "[a-z%]{1,4}", any::<bool>()).prop_map(|(col, pat, ci)| {
            if ci { col.ilike(pat.as_str()) } else { col.like(pat.as_str()) }
        }),
        (arb_column(), arb_value(), arb_value()).prop_map(|(col, a, b)| {
            (Expr::from(col) + Expr::Param(a)).gt(Expr::Param(b))
        }),
        any::<bool>().prop_map(Expr::Bool),
    ];

    leaf.prop_recursive(4, 48, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(|e| !e),
            prop::collection::vec(inner.clone(), 0..=4).prop_map(Expr::And),
            prop::collection::vec(inner.clone(), 0..=4).prop_map(Expr::Or),
            inner.prop_map(Expr::is_null),
        ]
    })
}

fn arb_statement() -> impl Strategy<Value = Expr> {
    (
        arb_predicate(),
        prop::collection::vec(arb_column(), 0..=3),
        proptest::option::of(0u64..50),
        proptest::option::of(0u64..50),
        any::<bool>(),
    )
        .prop_map(|(pred, order, limit, offset, distinct)| {
            let mut select = Select::new(columns().into_iter().take(2).map(Expr::from))
                .filter(pred)
                .distinct(distinct);
            for col in order {
                select = select.order_by(col.desc());
            }
            select.limit = limit;
            select.offset = offset;
            Expr::from(select)
        })
}

/// Same tree with every bound value replaced by a different one of the
/// same kind.
fn perturb(expr: &Expr) -> Expr {
    let boxed = |e: &Expr| Box::new(perturb(e));
    let all = |v: &[Expr]| v.iter().map(perturb).collect::<Vec<_>>();
    match expr {
        Expr::Param(Value::Int(n)) => Expr::Param(Value::Int(n.wrapping_add(7))),
        Expr::Param(Value::Text(s)) => Expr::Param(Value::Text(format!("{s}z"))),
        Expr::Param(Value::Bool(b)) => Expr::Param(Value::Bool(!b)),
        Expr::Compare { op, left, right } => Expr::Compare {
            op: *op,
            left: boxed(left),
            right: boxed(right),
        },
        Expr::Arith { op, left, right } => Expr::Arith {
            op: *op,
            left: boxed(left),
            right: boxed(right),
        },
        Expr::And(items) => Expr::And(all(items)),
        Expr::Or(items) => Expr::Or(all(items)),
        Expr::Not(e) => Expr::Not(boxed(e)),
        Expr::IsNull(e) => Expr::IsNull(boxed(e)),
        Expr::In { expr, values } => Expr::In {
            expr: boxed(expr),
            values: all(values),
        },
        Expr::Like {
            expr,
            pattern,
            case_insensitive,
        } => Expr::Like {
            expr: boxed(expr),
            pattern: boxed(pattern),
            case_insensitive: *case_insensitive,
        },
        Expr::Select(s) => {
            let mut s = (**s).clone();
            s.where_clause = perturb(&s.where_clause);
            Expr::Select(Box::new(s))
        }
        other => other.clone(),
    }
}

fn placeholder_count(sql: &str, dialect: &DialectProfile) -> usize {
    match dialect.placeholder {
        keel_core::PlaceholderStyle::Dollar => sql.matches('$').count(),
        _ => sql.matches('?').count(),
    }
}

proptest! {
    #[test]
    fn cached_matches_reference(stmt in arb_statement(), dialect in arb_dialect()) {
        let reference = compile(&stmt, &dialect);
        let mut fast = Compiler::cached(dialect.clone(), 16);
        let first = fast.compile(&stmt);
        let second = fast.compile(&stmt);
        match reference {
            Ok(expected) => {
                prop_assert_eq!(first.unwrap(), expected.clone());
                prop_assert_eq!(second.unwrap(), expected);
            }
            Err(_) => {
                prop_assert!(first.is_err());
                prop_assert!(second.is_err());
            }
        }
    }

    #[test]
    fn cache_hit_binds_new_values(stmt in arb_statement(), dialect in arb_dialect()) {
        let other = perturb(&stmt);
        prop_assert_eq!(shape_key(&stmt), shape_key(&other));
        let mut fast = Compiler::cached(dialect.clone(), 16);
        let _ = fast.compile(&stmt);
        match (compile(&other, &dialect), fast.compile(&other)) {
            (Ok(expected), Ok(actual)) => prop_assert_eq!(actual, expected),
            (Err(_), Err(_)) => {}
            (expected, actual) => prop_assert!(false, "divergence: {:?} vs {:?}", expected, actual),
        }
    }

    #[test]
    fn params_match_placeholders(stmt in arb_statement(), dialect in arb_dialect()) {
        if let Ok(compiled) = compile(&stmt, &dialect) {
            prop_assert_eq!(placeholder_count(&compiled.sql, &dialect), compiled.params.len());
            prop_assert!(compiled.params.iter().all(Value::is_wire));
        }
    }

    #[test]
    fn equal_shapes_render_equal_sql(a in arb_statement(), b in arb_statement()) {
        let dialect = DialectProfile::postgres();
        if shape_key(&a) == shape_key(&b) {
            if let (Ok(x), Ok(y)) = (compile(&a, &dialect), compile(&b, &dialect)) {
                prop_assert_eq!(x.sql, y.sql);
            }
        }
    }
}
