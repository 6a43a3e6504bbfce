//! Reduction facade for the guardedness checker.
//!
//! A single weak-head machine parameterized by [`RedFlags`]; the checker
//! only ever asks for three strengths: everything, everything without
//! constant unfolding, and everything without let reduction. Every
//! iteration burns one unit of the shared [`Fuel`] budget, so reduction of
//! an arbitrary (possibly ill-typed) term always terminates.

use std::cell::Cell;
use std::rc::Rc;

use crate::ast::{self, RecDef, Term};
use crate::checker::{Context, Env, RelDecl};
use crate::GuardError;

/// Selectable reduction strengths. ι is split into its match, fix and
/// cofix components so callers can pick exactly what a check needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedFlags {
    pub beta: bool,
    pub delta: bool,
    pub matches: bool,
    pub fix: bool,
    pub cofix: bool,
    pub zeta: bool,
}

impl RedFlags {
    /// β ι ζ δ
    pub const ALL: RedFlags = RedFlags {
        beta: true,
        delta: true,
        matches: true,
        fix: true,
        cofix: true,
        zeta: true,
    };

    /// β ι ζ, constants kept folded
    pub const BETAIOTAZETA: RedFlags = RedFlags {
        beta: true,
        delta: false,
        matches: true,
        fix: true,
        cofix: true,
        zeta: true,
    };

    /// β ι δ, lets preserved
    pub const ALLNOLET: RedFlags = RedFlags {
        beta: true,
        delta: true,
        matches: true,
        fix: true,
        cofix: true,
        zeta: false,
    };
}

/// Default step budget for a whole `check_fix` run.
pub const DEFAULT_FUEL: u64 = 4_000_000;

/// Shared step budget. The reducer loop and each entry into the mutually
/// recursive checker functions burn one unit; exhaustion surfaces as
/// [`GuardError::Timeout`].
#[derive(Debug)]
pub struct Fuel(Cell<u64>);

impl Fuel {
    pub fn new(units: u64) -> Fuel {
        Fuel(Cell::new(units))
    }

    pub fn tick(&self) -> Result<(), GuardError> {
        let left = self.0.get();
        if left == 0 {
            return Err(GuardError::Timeout);
        }
        self.0.set(left - 1);
        Ok(())
    }
}

impl Default for Fuel {
    fn default() -> Fuel {
        Fuel::new(DEFAULT_FUEL)
    }
}

pub fn whd_all(
    env: &Env,
    ctx: &Context,
    t: &Rc<Term>,
    fuel: &Fuel,
) -> Result<Rc<Term>, GuardError> {
    whd(env, ctx, RedFlags::ALL, t, fuel)
}

pub fn whd_betaiotazeta(
    env: &Env,
    ctx: &Context,
    t: &Rc<Term>,
    fuel: &Fuel,
) -> Result<Rc<Term>, GuardError> {
    whd(env, ctx, RedFlags::BETAIOTAZETA, t, fuel)
}

pub fn whd_all_nolet(
    env: &Env,
    ctx: &Context,
    t: &Rc<Term>,
    fuel: &Fuel,
) -> Result<Rc<Term>, GuardError> {
    whd(env, ctx, RedFlags::ALLNOLET, t, fuel)
}

/// Weak-head reduce `t` under the given flags.
pub fn whd(
    env: &Env,
    ctx: &Context,
    flags: RedFlags,
    t: &Rc<Term>,
    fuel: &Fuel,
) -> Result<Rc<Term>, GuardError> {
    let mut head = t.clone();
    // argument stack; the last entry is the first argument
    let mut rargs: Vec<Rc<Term>> = Vec::new();
    loop {
        fuel.tick()?;
        let cur = head.clone();
        match &*cur {
            Term::App(f, a) => {
                rargs.push(a.clone());
                head = f.clone();
            }
            Term::Cast(c, _) => head = c.clone(),
            Term::Lambda(_, b) if flags.beta && !rargs.is_empty() => {
                let a = rargs.pop().unwrap();
                head = b.subst(0, &a);
            }
            Term::LetIn(_, v, b) if flags.zeta => head = b.subst(0, v),
            Term::Rel(k) if flags.delta => match ctx.get(*k) {
                Some(RelDecl::Def(body, _)) => head = body.shift(0, k + 1),
                _ => break,
            },
            Term::Const(name, _) if flags.delta => {
                match env.lookup_constant(name).and_then(|c| c.body.clone()) {
                    Some(b) => head = b,
                    None => break,
                }
            }
            Term::Case(ci, p, discr, brs) if flags.matches => {
                let discr = whd(env, ctx, flags, discr, fuel)?;
                let (ch, cargs) = ast::decompose_app(&discr);
                match &*ch {
                    Term::Construct(_, k, _) if *k < brs.len() && cargs.len() >= ci.npar => {
                        head = ast::mk_app(brs[*k].clone(), &cargs[ci.npar..]);
                    }
                    Term::CoFix(ix, defs) if flags.cofix => {
                        let unfolded = ast::mk_app(contract_cofix(*ix, defs), &cargs);
                        head = Rc::new(Term::Case(ci.clone(), p.clone(), unfolded, brs.clone()));
                    }
                    _ => {
                        head = Rc::new(Term::Case(ci.clone(), p.clone(), discr, brs.clone()));
                        break;
                    }
                }
            }
            Term::Fix(rec_args, ix, defs) if flags.fix => {
                let Some(&rarg) = rec_args.get(*ix) else { break };
                if rargs.len() <= rarg {
                    break;
                }
                let slot = rargs.len() - 1 - rarg;
                let a = whd(env, ctx, flags, &rargs[slot], fuel)?;
                let (ch, _) = ast::decompose_app(&a);
                let fires = matches!(&*ch, Term::Construct(_, _, _));
                rargs[slot] = a;
                if fires {
                    head = contract_fix(rec_args, *ix, defs);
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    rargs.reverse();
    Ok(ast::mk_app(head, &rargs))
}

/// Replace the block's self-references by the fixpoints themselves and
/// select the unfolding body.
fn contract_fix(rec_args: &[usize], ix: usize, defs: &Rc<RecDef>) -> Rc<Term> {
    let n = defs.len();
    let subs: Vec<Rc<Term>> = (0..n)
        .map(|k| Rc::new(Term::Fix(rec_args.to_vec(), n - 1 - k, defs.clone())))
        .collect();
    defs.bodies[ix].subst_many(0, &subs)
}

fn contract_cofix(ix: usize, defs: &Rc<RecDef>) -> Rc<Term> {
    let n = defs.len();
    let subs: Vec<Rc<Term>> = (0..n)
        .map(|k| Rc::new(Term::CoFix(n - 1 - k, defs.clone())))
        .collect();
    defs.bodies[ix].subst_many(0, &subs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CaseInfo, ConstantBody, Constructor, Finiteness, IndRef, Level, MutInductive, OneInductive};
    use crate::rtree::{RTree, Recarg};

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

    fn zero() -> Rc<Term> {
        Term::ctor(nat_ref(), 0)
    }

    fn succ(t: Rc<Term>) -> Rc<Term> {
        Term::app(Term::ctor(nat_ref(), 1), t)
    }

    #[test]
    fn test_beta() {
        let env = Env::new();
        let ctx = Context::new();
        let fuel = Fuel::default();
        // (\x. x) zero --> zero
        let t = Term::app(Term::lam(nat(), Term::rel(0)), zero());
        let r = whd_all(&env, &ctx, &t, &fuel).unwrap();
        assert_eq!(r, zero());
    }

    #[test]
    fn test_zeta_only_when_enabled() {
        let env = Env::new();
        let ctx = Context::new();
        let fuel = Fuel::default();
        let t = Term::letin(nat(), zero(), Term::rel(0));
        assert_eq!(whd_all(&env, &ctx, &t, &fuel).unwrap(), zero());
        // the nolet strength leaves the let in place
        assert_eq!(whd_all_nolet(&env, &ctx, &t, &fuel).unwrap(), t);
    }

    #[test]
    fn test_delta_gated_by_flags() {
        let mut env = nat_env();
        env.add_constant(
            "one",
            ConstantBody {
                ty: nat(),
                body: Some(succ(zero())),
            },
        );
        let ctx = Context::new();
        let fuel = Fuel::default();
        let t = Term::constant("one");
        assert_eq!(whd_all(&env, &ctx, &t, &fuel).unwrap(), succ(zero()));
        // no δ in the βιζ strength
        assert_eq!(whd_betaiotazeta(&env, &ctx, &t, &fuel).unwrap(), t);
    }

    #[test]
    fn test_iota_match_on_constructor() {
        let env = nat_env();
        let ctx = Context::new();
        let fuel = Fuel::default();
        // match succ zero with 0 => zero | S p => p end --> zero
        let t = Rc::new(Term::Case(
            CaseInfo { ind: nat_ref(), npar: 0 },
            Term::lam(nat(), nat()),
            succ(zero()),
            vec![zero(), Term::lam(nat(), Term::rel(0))],
        ));
        assert_eq!(whd_all(&env, &ctx, &t, &fuel).unwrap(), zero());
    }

    #[test]
    fn test_fix_unfolds_on_constructor() {
        let env = nat_env();
        let ctx = Context::new();
        let fuel = Fuel::default();
        // fix pred n := match n with 0 => 0 | S p => p end
        let body = Term::lam(
            nat(),
            Rc::new(Term::Case(
                CaseInfo { ind: nat_ref(), npar: 0 },
                Term::lam(nat(), nat()),
                Term::rel(0),
                vec![zero(), Term::lam(nat(), Term::rel(0))],
            )),
        );
        let pred = Rc::new(Term::Fix(
            vec![0],
            0,
            Rc::new(RecDef {
                names: vec!["pred".to_string()],
                types: vec![Term::prod(nat(), nat())],
                bodies: vec![body],
            }),
        ));
        let t = Term::app(pred.clone(), succ(succ(zero())));
        assert_eq!(whd_all(&env, &ctx, &t, &fuel).unwrap(), succ(zero()));
        // stuck on a variable
        let ctx1 = ctx.push_assum(nat());
        let stuck = Term::app(pred, Term::rel(0));
        let r = whd_all(&env, &ctx1, &stuck, &fuel).unwrap();
        assert!(matches!(&*r, Term::App(_, _)));
    }

    #[test]
    fn test_rel_def_unfolds() {
        let env = nat_env();
        let fuel = Fuel::default();
        // context: [ x := zero ]
        let ctx = Context::new().push_def(zero(), nat());
        assert_eq!(whd_all(&env, &ctx, &Term::rel(0), &fuel).unwrap(), zero());
        assert_eq!(
            whd_betaiotazeta(&env, &ctx, &Term::rel(0), &fuel).unwrap(),
            Term::rel(0)
        );
    }

    #[test]
    fn test_fuel_exhaustion() {
        let mut env = Env::new();
        // loop := loop, δ-reduction never terminates
        env.add_constant(
            "loop",
            ConstantBody {
                ty: Term::sort(Level::Zero),
                body: Some(Term::constant("loop")),
            },
        );
        let ctx = Context::new();
        let fuel = Fuel::new(100);
        let r = whd_all(&env, &ctx, &Term::constant("loop"), &fuel);
        assert_eq!(r, Err(GuardError::Timeout));
    }
}
