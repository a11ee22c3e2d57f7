//! Filter-language safety: no input may panic, loop, or escape the
//! language. Exercises the grammar with generated and adversarial
//! inputs.

use guardrail::expr::{CompiledExpr, ExprContext, parse};

fn ctx() -> ExprContext {
    ExprContext::new()
        .with("ip.src", "8.8.8.8")
        .with("ip.src.country", "US")
        .with("ip.src.vpn", false)
        .with("tier", "free")
        .with("requests", 10.0)
}

/// Deterministic generator (xorshift) over grammar fragments.
struct Gen(u64);

impl Gen {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[(self.next() % items.len() as u64) as usize]
    }
}

const FRAGMENTS: &[&str] = &[
    "ip.src.country",
    "tier",
    "requests",
    "missing.name",
    r#""US""#,
    "'free'",
    "42",
    "-1",
    "3.25",
    "true",
    "false",
    "eq",
    "ne",
    "==",
    "!=",
    ">",
    "<",
    ">=",
    "<=",
    "and",
    "or",
    "not",
    "&&",
    "||",
    "!",
    "in",
    "matches",
    "(",
    ")",
    "[",
    "]",
    ",",
];

#[test]
fn test_generated_token_soup_never_panics() {
    let mut generator = Gen(0x9E3779B97F4A7C15);
    let bag = ctx();

    for _ in 0..5_000 {
        let length = (generator.next() % 12 + 1) as usize;
        let input = (0..length)
            .map(|_| generator.pick(FRAGMENTS))
            .collect::<Vec<_>>()
            .join(" ");

        // Parse may fail; evaluation of anything that parsed must not
        // panic and must produce a plain boolean.
        if let Ok(expr) = CompiledExpr::compile(&input) {
            let _ = expr.eval(&bag);
        }
    }
}

#[test]
fn test_well_formed_samples_evaluate() {
    let bag = ctx();
    let samples = [
        (r#"ip.src.country eq "US""#, true),
        (r#"ip.src.country ne "US""#, false),
        (r#"tier in ["free", "pro"]"#, true),
        ("requests >= 10", true),
        ("not ip.src.vpn", true),
        (r#"tier eq "free" and requests < 100"#, true),
        (r#"tier eq "pro" or ip.src.vpn"#, false),
        (r#"ip.src matches ("^8\.8\.")"#, true),
        ("missing.name", false),
    ];

    for (source, expected) in samples {
        let expr = CompiledExpr::compile(source).unwrap();
        assert_eq!(expr.eval(&bag).unwrap(), expected, "{source}");
    }
}

#[test]
fn test_adversarial_inputs_error_cleanly() {
    let adversarial = [
        String::from_utf8_lossy(&[0xf0, 0x9f, 0xa6, 0x80]).to_string(),
        "\u{202E}evil".to_string(),
        "a".repeat(100_000),
        format!("x in [{}]", "1,".repeat(10_000).trim_end_matches(',')),
        "(".repeat(100_000),
        format!("y matches (\"{}\")", "(a+)+".repeat(10)),
        "ip.src.country eq \u{0}".to_string(),
    ];

    let bag = ctx();
    for input in adversarial {
        if let Ok(expr) = CompiledExpr::compile(&input) {
            let _ = expr.eval(&bag);
        }
    }
}

#[test]
fn test_redos_shapes_rejected_at_eval() {
    let bag = ctx().with("payload", "a".repeat(100));
    for pattern in ["(a+)+$", "(a*)*$", "([a-z]+)*$"] {
        let source = format!(r#"payload matches ("{pattern}")"#);
        let expr = CompiledExpr::compile(&source).unwrap();
        // The guard rejects the pattern; the rule layer treats the
        // error as "predicate false".
        assert!(expr.eval(&bag).is_err(), "{pattern}");
    }
}

#[test]
fn test_no_identifier_resolves_to_code() {
    // Identifiers bind to data only; unknown names are merely missing.
    let bag = ctx();
    for name in [
        "std.process.exit",
        "__proto__",
        "constructor",
        "eval",
        "require",
    ] {
        let expr = parse(name).unwrap();
        assert!(!guardrail::expr::evaluate(&expr, &bag).unwrap());
    }
}
