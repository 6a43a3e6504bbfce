use std::rc::Rc;

use crate::rtree::WfPaths;

/// Universe levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Level {
    Zero,
    Succ(Box<Level>),
    Max(Box<Level>, Box<Level>),
    IMax(Box<Level>, Box<Level>),
    Param(String),
}

/// Reference to one body of a mutual inductive block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndRef {
    /// Name of the mutual block.
    pub name: String,
    /// Position of the body inside the block.
    pub index: usize,
}

impl IndRef {
    pub fn new(name: &str, index: usize) -> IndRef {
        IndRef {
            name: name.to_string(),
            index,
        }
    }
}

/// Primitive projection out of a record-like inductive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub ind: IndRef,
    pub npars: usize,
    /// Index of the projected field among the constructor arguments.
    pub arg: usize,
}

/// Static data attached to a match node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseInfo {
    pub ind: IndRef,
    /// Number of parameters of the block, dropped when a branch fires.
    pub npar: usize,
}

/// Bodies of a mutually recursive (co)fixpoint block. The types live in
/// the enclosing context; the bodies additionally see one variable per
/// sibling, the last one being de Bruijn index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecDef {
    pub names: Vec<String>,
    pub types: Vec<Rc<Term>>,
    pub bodies: Vec<Rc<Term>>,
}

impl RecDef {
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    fn shift(&self, c: usize, d: usize) -> RecDef {
        let n = self.len();
        RecDef {
            names: self.names.clone(),
            types: self.types.iter().map(|t| t.shift(c, d)).collect(),
            bodies: self.bodies.iter().map(|b| b.shift(c + n, d)).collect(),
        }
    }

    fn subst_many(&self, k: usize, subs: &[Rc<Term>]) -> RecDef {
        let n = self.len();
        RecDef {
            names: self.names.clone(),
            types: self.types.iter().map(|t| t.subst_many(k, subs)).collect(),
            bodies: self
                .bodies
                .iter()
                .map(|b| b.subst_many(k + n, subs))
                .collect(),
        }
    }

    fn noccur_with_evars(&self, n: usize, m: usize) -> bool {
        let nb = self.len();
        self.types.iter().all(|t| t.noccur_with_evars(n, m))
            && self.bodies.iter().all(|b| b.noccur_with_evars(n + nb, m))
    }
}

/// The core terms of the calculus, using de Bruijn indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Bound variable (de Bruijn index)
    Rel(usize),
    /// Named hypothesis; not supported by the checker
    Var(String),
    /// Existential variable; not supported by the checker
    Evar(usize),
    /// Universe
    Sort(Level),
    /// Type ascription `(t : T)`
    Cast(Rc<Term>, Rc<Term>),
    /// Dependent product `(x : A) -> B`
    Prod(Rc<Term>, Rc<Term>),
    /// Lambda abstraction `\x : A. b`
    Lambda(Rc<Term>, Rc<Term>),
    /// `let x : A := v in b`, stored as (A, v, b)
    LetIn(Rc<Term>, Rc<Term>, Rc<Term>),
    /// Application `(f a)`
    App(Rc<Term>, Rc<Term>),
    /// Universe-polymorphic global constant
    Const(String, Vec<Level>),
    /// Inductive type
    Ind(IndRef, Vec<Level>),
    /// `Construct(ind, k, _)` is the `k`-th constructor of `ind`
    Construct(IndRef, usize, Vec<Level>),
    /// Pattern match: case info, return-type function, discriminant and
    /// one λ-abstracted body per constructor
    Case(CaseInfo, Rc<Term>, Rc<Term>, Vec<Rc<Term>>),
    /// Mutual fixpoint: decreasing-argument indices, selected body, defs
    Fix(Vec<usize>, usize, Rc<RecDef>),
    /// Mutual cofixpoint: selected body, defs
    CoFix(usize, Rc<RecDef>),
    /// Primitive projection applied to a term
    Proj(Projection, Rc<Term>),
}

// Helper constructors for convenience
impl Term {
    pub fn rel(n: usize) -> Rc<Self> {
        Rc::new(Term::Rel(n))
    }

    pub fn sort(l: Level) -> Rc<Self> {
        Rc::new(Term::Sort(l))
    }

    pub fn set() -> Rc<Self> {
        Term::sort(Level::Succ(Box::new(Level::Zero)))
    }

    pub fn app(f: Rc<Term>, a: Rc<Term>) -> Rc<Self> {
        Rc::new(Term::App(f, a))
    }

    pub fn lam(ty: Rc<Term>, body: Rc<Term>) -> Rc<Self> {
        Rc::new(Term::Lambda(ty, body))
    }

    pub fn prod(ty: Rc<Term>, body: Rc<Term>) -> Rc<Self> {
        Rc::new(Term::Prod(ty, body))
    }

    pub fn letin(ty: Rc<Term>, val: Rc<Term>, body: Rc<Term>) -> Rc<Self> {
        Rc::new(Term::LetIn(ty, val, body))
    }

    pub fn constant(name: &str) -> Rc<Self> {
        Rc::new(Term::Const(name.to_string(), vec![]))
    }

    pub fn ind(r: IndRef) -> Rc<Self> {
        Rc::new(Term::Ind(r, vec![]))
    }

    pub fn ctor(r: IndRef, idx: usize) -> Rc<Self> {
        Rc::new(Term::Construct(r, idx, vec![]))
    }

    /// Shift indices in a term by `d` above cutoff `c`.
    pub fn shift(&self, c: usize, d: usize) -> Rc<Term> {
        match self {
            Term::Rel(k) => {
                if *k < c {
                    Term::rel(*k)
                } else {
                    Term::rel(k + d)
                }
            }
            Term::Var(_)
            | Term::Evar(_)
            | Term::Sort(_)
            | Term::Const(_, _)
            | Term::Ind(_, _)
            | Term::Construct(_, _, _) => Rc::new(self.clone()),
            Term::Cast(t, ty) => Rc::new(Term::Cast(t.shift(c, d), ty.shift(c, d))),
            Term::Prod(ty, body) => Rc::new(Term::Prod(ty.shift(c, d), body.shift(c + 1, d))),
            Term::Lambda(ty, body) => Rc::new(Term::Lambda(ty.shift(c, d), body.shift(c + 1, d))),
            Term::LetIn(ty, v, b) => Rc::new(Term::LetIn(
                ty.shift(c, d),
                v.shift(c, d),
                b.shift(c + 1, d),
            )),
            Term::App(f, a) => Rc::new(Term::App(f.shift(c, d), a.shift(c, d))),
            Term::Case(ci, p, discr, brs) => Rc::new(Term::Case(
                ci.clone(),
                p.shift(c, d),
                discr.shift(c, d),
                brs.iter().map(|b| b.shift(c, d)).collect(),
            )),
            Term::Fix(ra, ix, defs) => Rc::new(Term::Fix(ra.clone(), *ix, Rc::new(defs.shift(c, d)))),
            Term::CoFix(ix, defs) => Rc::new(Term::CoFix(*ix, Rc::new(defs.shift(c, d)))),
            Term::Proj(p, t) => Rc::new(Term::Proj(p.clone(), t.shift(c, d))),
        }
    }

    /// Shift all free indices by `d`.
    pub fn lift(&self, d: usize) -> Rc<Term> {
        if d == 0 {
            Rc::new(self.clone())
        } else {
            self.shift(0, d)
        }
    }

    /// Substitute `subs[i]` for `Rel(k + i)`; indices above the
    /// substituted range drop by `subs.len()`.
    pub fn subst_many(&self, k: usize, subs: &[Rc<Term>]) -> Rc<Term> {
        match self {
            Term::Rel(i) => {
                if *i < k {
                    Term::rel(*i)
                } else if *i < k + subs.len() {
                    subs[*i - k].shift(0, k)
                } else {
                    Term::rel(*i - subs.len())
                }
            }
            Term::Var(_)
            | Term::Evar(_)
            | Term::Sort(_)
            | Term::Const(_, _)
            | Term::Ind(_, _)
            | Term::Construct(_, _, _) => Rc::new(self.clone()),
            Term::Cast(t, ty) => Rc::new(Term::Cast(t.subst_many(k, subs), ty.subst_many(k, subs))),
            Term::Prod(ty, body) => Rc::new(Term::Prod(
                ty.subst_many(k, subs),
                body.subst_many(k + 1, subs),
            )),
            Term::Lambda(ty, body) => Rc::new(Term::Lambda(
                ty.subst_many(k, subs),
                body.subst_many(k + 1, subs),
            )),
            Term::LetIn(ty, v, b) => Rc::new(Term::LetIn(
                ty.subst_many(k, subs),
                v.subst_many(k, subs),
                b.subst_many(k + 1, subs),
            )),
            Term::App(f, a) => Rc::new(Term::App(f.subst_many(k, subs), a.subst_many(k, subs))),
            Term::Case(ci, p, discr, brs) => Rc::new(Term::Case(
                ci.clone(),
                p.subst_many(k, subs),
                discr.subst_many(k, subs),
                brs.iter().map(|b| b.subst_many(k, subs)).collect(),
            )),
            Term::Fix(ra, ix, defs) => {
                Rc::new(Term::Fix(ra.clone(), *ix, Rc::new(defs.subst_many(k, subs))))
            }
            Term::CoFix(ix, defs) => Rc::new(Term::CoFix(*ix, Rc::new(defs.subst_many(k, subs)))),
            Term::Proj(p, t) => Rc::new(Term::Proj(p.clone(), t.subst_many(k, subs))),
        }
    }

    /// Substitute `s` for `Rel(k)`.
    pub fn subst(&self, k: usize, s: &Rc<Term>) -> Rc<Term> {
        self.subst_many(k, std::slice::from_ref(s))
    }

    /// `true` when no `Rel` in `[n, n + m)` occurs free. Existential
    /// variables count as occurrences, since they could hide anything.
    pub fn noccur_with_evars(&self, n: usize, m: usize) -> bool {
        match self {
            Term::Rel(k) => *k < n || *k >= n + m,
            Term::Evar(_) => false,
            Term::Var(_) | Term::Sort(_) | Term::Const(_, _) | Term::Ind(_, _) | Term::Construct(_, _, _) => true,
            Term::Cast(t, ty) => t.noccur_with_evars(n, m) && ty.noccur_with_evars(n, m),
            Term::Prod(ty, body) | Term::Lambda(ty, body) => {
                ty.noccur_with_evars(n, m) && body.noccur_with_evars(n + 1, m)
            }
            Term::LetIn(ty, v, b) => {
                ty.noccur_with_evars(n, m)
                    && v.noccur_with_evars(n, m)
                    && b.noccur_with_evars(n + 1, m)
            }
            Term::App(f, a) => f.noccur_with_evars(n, m) && a.noccur_with_evars(n, m),
            Term::Case(_, p, discr, brs) => {
                p.noccur_with_evars(n, m)
                    && discr.noccur_with_evars(n, m)
                    && brs.iter().all(|b| b.noccur_with_evars(n, m))
            }
            Term::Fix(_, _, defs) | Term::CoFix(_, defs) => defs.noccur_with_evars(n, m),
            Term::Proj(_, t) => t.noccur_with_evars(n, m),
        }
    }
}

/// Split an application spine into head and arguments, first argument
/// first.
pub fn decompose_app(t: &Rc<Term>) -> (Rc<Term>, Vec<Rc<Term>>) {
    let mut args = Vec::new();
    let mut head = t.clone();
    while let Term::App(f, a) = &*head.clone() {
        args.push(a.clone());
        head = f.clone();
    }
    args.reverse();
    (head, args)
}

/// Apply `head` to `args`, left to right.
pub fn mk_app(head: Rc<Term>, args: &[Rc<Term>]) -> Rc<Term> {
    args.iter().fold(head, |f, a| Term::app(f, a.clone()))
}

/// A single constructor of an inductive type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constructor {
    pub name: String,
    /// Type in the context of the mutual block, parameters included; the
    /// last body of the block is de Bruijn index 0 at the root.
    pub ty: Rc<Term>,
}

/// Whether an inductive block is well-founded data, co-inductive codata,
/// or a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finiteness {
    Finite,
    CoFinite,
    BiFinite,
}

/// One body of a mutual inductive block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneInductive {
    pub name: String,
    /// The arity, e.g. `Type` or `A -> Type`.
    pub arity: Rc<Term>,
    pub ctors: Vec<Constructor>,
    /// Recursive-argument tree produced by the positivity checker.
    pub recargs: WfPaths,
}

/// A block of mutually defined inductive types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutInductive {
    pub npars: usize,
    pub bodies: Vec<OneInductive>,
    pub finite: Finiteness,
}

/// A global constant. `body` is `None` for axioms; such constants never
/// unfold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantBody {
    pub ty: Rc<Term>,
    pub body: Option<Rc<Term>>,
}
