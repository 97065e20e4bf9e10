use salt::domain::{FilterError, FilterTarget};
use salt::filter::{compile_expression, tokenize, FilterEngine, FilterRule, Relation};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn engine(relation: Relation) -> FilterEngine {
    let mut engine = FilterEngine::new();
    engine.add(FilterTarget::Process, &names(&["bash", "sshd"]));
    engine.add(FilterTarget::Cache, &names(&["kmalloc-64"]));
    engine.set_relation(relation);
    engine.enable();
    engine
}

#[test]
fn test_or_accepts_either_side() {
    let engine = engine(Relation::Or);
    assert!(engine.evaluate("bash", Some("dentry")));
    assert!(engine.evaluate("cron", Some("kmalloc-64")));
    assert!(engine.evaluate("sshd", None));
    assert!(!engine.evaluate("cron", Some("dentry")));
    assert!(!engine.evaluate("cron", None));
}

#[test]
fn test_and_requires_both_sides() {
    let engine = engine(Relation::And);
    assert!(engine.evaluate("bash", Some("kmalloc-64")));
    assert!(!engine.evaluate("bash", Some("dentry")));
    assert!(!engine.evaluate("cron", Some("kmalloc-64")));
    assert!(!engine.evaluate("bash", None));
}

#[test]
fn test_disabled_filter_keeps_rule() {
    let mut engine = engine(Relation::And);
    engine.disable();
    assert!(engine.evaluate("cron", None));
    engine.enable();
    assert!(!engine.evaluate("cron", None));
}

#[test]
fn test_expression_replaces_simple_sets() {
    let mut engine = engine(Relation::Or);
    engine.set_expression(&tokenize("(kmalloc-32 or dentry) and (find)")).unwrap();
    assert!(matches!(engine.current_filter(), FilterRule::Expression(_)));
    assert!(engine.evaluate("find", Some("dentry")));
    assert!(!engine.evaluate("bash", Some("dentry")));
    assert!(!engine.evaluate("find", None));

    // editing a set drops back to the simple rule
    engine.add(FilterTarget::Cache, &names(&["filp"]));
    assert!(engine.evaluate("cron", Some("filp")));
}

#[test]
fn test_malformed_expression_keeps_previous_rule() {
    let mut engine = engine(Relation::And);
    let before = engine.current_filter();
    for text in ["kmalloc-64 bash", "a and b and c", "and bash", "(dentry) and ()"] {
        let err = engine.set_expression(&tokenize(text)).unwrap_err();
        assert!(matches!(err, FilterError::MalformedExpression(_)), "{text}");
    }
    assert_eq!(engine.current_filter(), before);
}

#[test]
fn test_expression_display_is_normalized() {
    let expr = compile_expression(&tokenize("dentry | kmalloc-8 && (bash, zsh)")).unwrap();
    assert_eq!(expr.to_string(), "(dentry OR kmalloc-8) AND (bash OR zsh)");
}

#[test]
fn test_remove_is_all_or_nothing() {
    let mut engine = engine(Relation::Or);
    let err = engine.remove(FilterTarget::Process, &names(&["bash", "nobody"])).unwrap_err();
    assert_eq!(err.to_string(), "'nobody' is not among filtered processes.");
    assert!(engine.evaluate("bash", None));

    engine.remove(FilterTarget::Process, &names(&["bash"])).unwrap();
    assert!(!engine.evaluate("bash", None));
}

#[test]
fn test_set_filter_roundtrip() {
    let mut source = engine(Relation::And);
    let rule = source.current_filter();
    let mut other = FilterEngine::new();
    other.set_filter(rule.clone());
    assert_eq!(other.current_filter(), rule);
    source.reset();
    assert_eq!(source.current_filter(), FilterRule::default());
    assert!(source.is_enabled());
}
