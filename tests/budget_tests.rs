//! Step-budget behavior and determinism of the checker.

use std::rc::Rc;

use fixcheck::ast::{
    CaseInfo, Constructor, Finiteness, IndRef, MutInductive, OneInductive, RecDef, Term,
};
use fixcheck::rtree::{RTree, Recarg};
use fixcheck::{check_fix, check_fix_with_fuel, Context, Env, ErrorKind, GuardError};

fn nat_ref() -> IndRef {
    IndRef::new("Nat", 0)
}

fn nat() -> Rc<Term> {
    Term::ind(nat_ref())
}

fn nat_tree() -> RTree {
    let def = RTree::node(
        Recarg::Mrec(nat_ref()),
        vec![
            RTree::node(Recarg::Norec, vec![]),
            RTree::node(Recarg::Norec, vec![RTree::Param(0, 0)]),
        ],
    );
    RTree::mk_rec(&[def]).remove(0)
}

fn nat_env() -> Env {
    let mut env = Env::new();
    env.add_inductive(
        "Nat",
        MutInductive {
            npars: 0,
            finite: Finiteness::Finite,
            bodies: vec![OneInductive {
                name: "Nat".to_string(),
                arity: Term::set(),
                ctors: vec![
                    Constructor {
                        name: "zero".to_string(),
                        ty: Term::rel(0),
                    },
                    Constructor {
                        name: "succ".to_string(),
                        ty: Term::prod(Term::rel(0), Term::rel(1)),
                    },
                ],
                recargs: nat_tree(),
            }],
        },
    );
    env
}

/// `fix half (n : Nat) := match n with 0 => 0 | S p =>
///    match p with 0 => 0 | S q => S (half q) end end`
fn half_fix(guarded: bool) -> Rc<Term> {
    let zero = Term::ctor(nat_ref(), 0);
    let succ = |t| Term::app(Term::ctor(nat_ref(), 1), t);
    // inner branch: q = Rel 0, p = Rel 1, n = Rel 2, half = Rel 3
    let call_arg = if guarded { Term::rel(0) } else { Term::rel(2) };
    let inner = Rc::new(Term::Case(
        CaseInfo {
            ind: nat_ref(),
            npar: 0,
        },
        Term::lam(nat(), nat()),
        Term::rel(0),
        vec![
            zero.clone(),
            Term::lam(nat(), succ(Term::app(Term::rel(3), call_arg))),
        ],
    ));
    let body = Term::lam(
        nat(),
        Rc::new(Term::Case(
            CaseInfo {
                ind: nat_ref(),
                npar: 0,
            },
            Term::lam(nat(), nat()),
            Term::rel(0),
            vec![zero, Term::lam(nat(), inner)],
        )),
    );
    Rc::new(Term::Fix(
        vec![0],
        0,
        Rc::new(RecDef {
            names: vec!["half".to_string()],
            types: vec![Term::prod(nat(), nat())],
            bodies: vec![body],
        }),
    ))
}

#[test]
fn test_exhausted_budget_reports_timeout() {
    let env = nat_env();
    let err = check_fix_with_fuel(&env, &Context::new(), &half_fix(true), 3).unwrap_err();
    assert_eq!(err, GuardError::Timeout);
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn test_default_budget_is_plenty() {
    let env = nat_env();
    assert_eq!(check_fix(&env, &Context::new(), &half_fix(true)), Ok(()));
}

#[test]
fn test_check_fix_is_deterministic() {
    let env = nat_env();
    let ctx = Context::new();
    for fix in [half_fix(true), half_fix(false)] {
        let first = check_fix(&env, &ctx, &fix);
        let second = check_fix(&env, &ctx, &fix);
        assert_eq!(first, second);
    }
    assert!(check_fix(&env, &ctx, &half_fix(false)).is_err());
}

#[test]
fn test_non_fix_term_is_a_programming_error() {
    let env = nat_env();
    let err = check_fix(&env, &Context::new(), &Term::ctor(nat_ref(), 0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Programming);
}
