//! Tagged expression tree for the objective/constraint functions the solver
//! consumes (§4.4). Rather than generating source text and `eval`-ing it, the
//! emitter builds this tree once per workflow and the solver interprets it
//! directly against a decision vector `x` and a parameter vector `p` — the
//! same tree also drives forward-mode automatic differentiation for the
//! solver's gradient steps. A pretty-printer renders the tree as a small
//! S-expression so the "emitted functions file" round-trip property (emit →
//! parse → evaluate) has something concrete to exercise; a matching parser
//! lives alongside it.

use std::fmt;

/// One node of a latency/cost expression over decision variables `x[..]`
/// and parameter-vector entries `p[..]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant literal.
    Const(f64),
    /// `x[i]`, a decision-variable slot.
    Var(usize),
    /// `p[i]`, a parameter-vector slot (treated as a constant under
    /// differentiation w.r.t. `x`).
    Param(usize),
    /// `a + b`
    Add(Box<Expr>, Box<Expr>),
    /// `a - b`
    Sub(Box<Expr>, Box<Expr>),
    /// `a * b`
    Mul(Box<Expr>, Box<Expr>),
    /// `a / b`
    Div(Box<Expr>, Box<Expr>),
    /// `a^n` for a fixed real exponent `n`.
    Pow(Box<Expr>, f64),
    /// `ln(a)`
    Log(Box<Expr>),
}

impl Expr {
    pub fn konst(v: f64) -> Self {
        Expr::Const(v)
    }

    pub fn var(i: usize) -> Self {
        Expr::Var(i)
    }

    pub fn param(i: usize) -> Self {
        Expr::Param(i)
    }

    pub fn add(self, rhs: Expr) -> Self {
        Expr::Add(Box::new(self), Box::new(rhs))
    }

    pub fn sub(self, rhs: Expr) -> Self {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }

    pub fn mul(self, rhs: Expr) -> Self {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }

    pub fn div(self, rhs: Expr) -> Self {
        Expr::Div(Box::new(self), Box::new(rhs))
    }

    pub fn pow(self, n: f64) -> Self {
        Expr::Pow(Box::new(self), n)
    }

    pub fn ln(self) -> Self {
        Expr::Log(Box::new(self))
    }

    /// Sum a non-empty list of expressions; empty input yields `Const(0.0)`.
    pub fn sum(mut terms: Vec<Expr>) -> Self {
        match terms.len() {
            0 => Expr::Const(0.0),
            1 => terms.remove(0),
            _ => {
                let mut it = terms.into_iter();
                let first = it.next().unwrap();
                it.fold(first, |acc, t| acc.add(t))
            }
        }
    }

    /// Evaluate the expression at a decision vector `x` and parameter vector `p`.
    pub fn eval(&self, x: &[f64], p: &[f64]) -> f64 {
        match self {
            Expr::Const(v) => *v,
            Expr::Var(i) => x[*i],
            Expr::Param(i) => p[*i],
            Expr::Add(a, b) => a.eval(x, p) + b.eval(x, p),
            Expr::Sub(a, b) => a.eval(x, p) - b.eval(x, p),
            Expr::Mul(a, b) => a.eval(x, p) * b.eval(x, p),
            Expr::Div(a, b) => a.eval(x, p) / b.eval(x, p),
            Expr::Pow(a, n) => a.eval(x, p).powf(*n),
            Expr::Log(a) => a.eval(x, p).ln(),
        }
    }

    /// Evaluate value and gradient w.r.t. every entry of `x` in one forward
    /// pass, via a dual number carrying a dense tangent vector.
    pub fn eval_grad(&self, x: &[f64], p: &[f64]) -> Dual {
        match self {
            Expr::Const(v) => Dual::constant(*v, x.len()),
            Expr::Var(i) => Dual::variable(x[*i], *i, x.len()),
            Expr::Param(i) => Dual::constant(p[*i], x.len()),
            Expr::Add(a, b) => a.eval_grad(x, p) + b.eval_grad(x, p),
            Expr::Sub(a, b) => a.eval_grad(x, p) - b.eval_grad(x, p),
            Expr::Mul(a, b) => a.eval_grad(x, p) * b.eval_grad(x, p),
            Expr::Div(a, b) => a.eval_grad(x, p) / b.eval_grad(x, p),
            Expr::Pow(a, n) => a.eval_grad(x, p).powf(*n),
            Expr::Log(a) => a.eval_grad(x, p).ln(),
        }
    }

    /// Render as a small, fully parenthesized S-expression. This stands in
    /// for the "emitted functions file" of §6; [`parse`] is its inverse.
    pub fn to_pretty_string(&self) -> String {
        match self {
            Expr::Const(v) => format!("(const {v})"),
            Expr::Var(i) => format!("(x {i})"),
            Expr::Param(i) => format!("(p {i})"),
            Expr::Add(a, b) => format!("(+ {} {})", a.to_pretty_string(), b.to_pretty_string()),
            Expr::Sub(a, b) => format!("(- {} {})", a.to_pretty_string(), b.to_pretty_string()),
            Expr::Mul(a, b) => format!("(* {} {})", a.to_pretty_string(), b.to_pretty_string()),
            Expr::Div(a, b) => format!("(/ {} {})", a.to_pretty_string(), b.to_pretty_string()),
            Expr::Pow(a, n) => format!("(pow {} {n})", a.to_pretty_string()),
            Expr::Log(a) => format!("(ln {})", a.to_pretty_string()),
        }
    }

    /// Parse the output of [`to_pretty_string`] back into an `Expr`.
    pub fn parse(s: &str) -> Result<Expr, String> {
        let tokens = tokenize(s);
        let mut pos = 0;
        let e = parse_tokens(&tokens, &mut pos)?;
        if pos != tokens.len() {
            return Err(format!("trailing tokens after expression: {:?}", &tokens[pos..]));
        }
        Ok(e)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_pretty_string())
    }
}

fn tokenize(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '(' | ')' => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
                out.push(c.to_string());
            }
            c if c.is_whitespace() => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn parse_tokens(tokens: &[String], pos: &mut usize) -> Result<Expr, String> {
    if *pos >= tokens.len() {
        return Err("unexpected end of input".to_string());
    }
    if tokens[*pos] != "(" {
        return Err(format!("expected '(' at token {}", pos));
    }
    *pos += 1;
    let head = tokens
        .get(*pos)
        .ok_or_else(|| "unexpected end of input".to_string())?
        .clone();
    *pos += 1;

    let expr = match head.as_str() {
        "const" => {
            let v: f64 = tokens[*pos].parse().map_err(|e| format!("{e}"))?;
            *pos += 1;
            Expr::Const(v)
        }
        "x" => {
            let i: usize = tokens[*pos].parse().map_err(|e| format!("{e}"))?;
            *pos += 1;
            Expr::Var(i)
        }
        "p" => {
            let i: usize = tokens[*pos].parse().map_err(|e| format!("{e}"))?;
            *pos += 1;
            Expr::Param(i)
        }
        "ln" => {
            let a = parse_tokens(tokens, pos)?;
            Expr::Log(Box::new(a))
        }
        "pow" => {
            let a = parse_tokens(tokens, pos)?;
            let n: f64 = tokens[*pos].parse().map_err(|e| format!("{e}"))?;
            *pos += 1;
            Expr::Pow(Box::new(a), n)
        }
        "+" | "-" | "*" | "/" => {
            let a = parse_tokens(tokens, pos)?;
            let b = parse_tokens(tokens, pos)?;
            match head.as_str() {
                "+" => Expr::Add(Box::new(a), Box::new(b)),
                "-" => Expr::Sub(Box::new(a), Box::new(b)),
                "*" => Expr::Mul(Box::new(a), Box::new(b)),
                "/" => Expr::Div(Box::new(a), Box::new(b)),
                _ => unreachable!(),
            }
        }
        other => return Err(format!("unknown operator '{other}'")),
    };

    if tokens.get(*pos).map(String::as_str) != Some(")") {
        return Err(format!("expected ')' at token {}", pos));
    }
    *pos += 1;
    Ok(expr)
}

/// A value paired with its gradient w.r.t. every decision-vector entry,
/// propagated by the standard forward-mode AD rules.
#[derive(Debug, Clone)]
pub struct Dual {
    pub val: f64,
    pub grad: Vec<f64>,
}

impl Dual {
    fn constant(val: f64, n: usize) -> Self {
        Dual { val, grad: vec![0.0; n] }
    }

    fn variable(val: f64, index: usize, n: usize) -> Self {
        let mut grad = vec![0.0; n];
        grad[index] = 1.0;
        Dual { val, grad }
    }

    fn zip_with(&self, other: &Dual, f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
        self.grad
            .iter()
            .zip(other.grad.iter())
            .map(|(&a, &b)| f(a, b))
            .collect()
    }

    fn ln(&self) -> Dual {
        Dual {
            val: self.val.ln(),
            grad: self.grad.iter().map(|&g| g / self.val).collect(),
        }
    }

    fn powf(&self, n: f64) -> Dual {
        let deriv = n * self.val.powf(n - 1.0);
        Dual {
            val: self.val.powf(n),
            grad: self.grad.iter().map(|&g| deriv * g).collect(),
        }
    }
}

impl std::ops::Add for Dual {
    type Output = Dual;
    fn add(self, rhs: Dual) -> Dual {
        let grad = self.zip_with(&rhs, |a, b| a + b);
        Dual { val: self.val + rhs.val, grad }
    }
}

impl std::ops::Sub for Dual {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        let grad = self.zip_with(&rhs, |a, b| a - b);
        Dual { val: self.val - rhs.val, grad }
    }
}

impl std::ops::Mul for Dual {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        let grad = self
            .grad
            .iter()
            .zip(rhs.grad.iter())
            .map(|(&a, &b)| a * rhs.val + b * self.val)
            .collect();
        Dual { val: self.val * rhs.val, grad }
    }
}

impl std::ops::Div for Dual {
    type Output = Dual;
    fn div(self, rhs: Dual) -> Dual {
        let denom = rhs.val * rhs.val;
        let grad = self
            .grad
            .iter()
            .zip(rhs.grad.iter())
            .map(|(&a, &b)| (a * rhs.val - b * self.val) / denom)
            .collect();
        Dual { val: self.val / rhs.val, grad }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_matches_hand_computation() {
        // (p0 / x0) + (p1 * ln(x1) / x1)
        let e = Expr::param(0)
            .div(Expr::var(0))
            .add(Expr::param(1).mul(Expr::var(1).ln().div(Expr::var(1))));
        let x = [2.0, 4.0];
        let p = [10.0, 3.0];
        let expected = 10.0 / 2.0 + 3.0 * (4.0f64.ln()) / 4.0;
        assert!((e.eval(&x, &p) - expected).abs() < 1e-12);
    }

    #[test]
    fn pretty_print_round_trips() {
        let e = Expr::param(2)
            .div(Expr::var(0).mul(Expr::var(1)))
            .add(Expr::var(0).pow(2.0));
        let rendered = e.to_pretty_string();
        let parsed = Expr::parse(&rendered).expect("parse");
        let x = [1.5, 2.5];
        let p = [0.0, 0.0, 7.0];
        assert!((e.eval(&x, &p) - parsed.eval(&x, &p)).abs() < 1e-12);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let e = Expr::param(0)
            .div(Expr::var(0))
            .add(Expr::param(1).mul(Expr::var(0).mul(Expr::var(1))).pow(2.0));
        let x = [3.0, 1.7];
        let p = [5.0, 0.3];
        let dual = e.eval_grad(&x, &p);
        let h = 1e-6;
        for i in 0..x.len() {
            let mut xp = x.to_vec();
            xp[i] += h;
            let mut xm = x.to_vec();
            xm[i] -= h;
            let fd = (e.eval(&xp, &p) - e.eval(&xm, &p)) / (2.0 * h);
            assert!((dual.grad[i] - fd).abs() < 1e-3, "grad[{i}] mismatch: {} vs {}", dual.grad[i], fd);
        }
    }
}
