use graphpersist::storage::{Column, ModelSchema, RelationColumn};
use graphpersist::{
    ColumnType, ConfigFix, DropReason, EngineError, EntityTypeBuilder, FixTarget, Graph,
    MemoryBackend, Node, Persister, RelationKind, Result, Scope, TypeRegistry, key_set,
};

fn registry() -> Result<TypeRegistry> {
    let registry = TypeRegistry::new();
    registry.register(
        EntityTypeBuilder::new("author")
            .field("name", ColumnType::Text)
            .relation("books", "book", RelationKind::OneToMany, Some("author"))
            .unique(["name"]),
    )?;
    registry.register(
        EntityTypeBuilder::new("book")
            .field("title", ColumnType::Text)
            .relation("author", "author", RelationKind::ManyToOne, Some("books"))
            .required(["title"]),
    )?;
    Ok(registry)
}

#[test]
fn test_scopes_are_isolated_from_each_other() -> Result<()> {
    let registry = registry()?;
    let book = registry.find("book")?;

    let strict = Scope::new(
        &registry,
        Some("strict"),
        [(FixTarget::AnyType, ConfigFix::new().get_only(true))],
    )?;
    let loose = Scope::new(&registry, Some("loose"), Vec::new())?;

    let strict_book = registry.get(strict.get(book)?)?;
    let loose_book = registry.get(loose.get(book)?)?;
    assert_eq!(strict_book.name(), "book@strict");
    assert_eq!(loose_book.name(), "book@loose");
    assert_eq!(strict_book.model(), "book");
    assert!(strict_book.config().get_only);
    assert!(!loose_book.config().get_only);
    assert!(!registry.get(book)?.config().get_only);

    // Derived types are registered under their scoped names
    assert_eq!(registry.find("author@strict")?, strict.get_by_name("author")?);
    Ok(())
}

#[test]
fn test_scope_fixes_can_extend_autoconfigured_groups() -> Result<()> {
    let registry = registry()?;
    let book = registry.find("book")?;
    let author = registry.find("author")?;
    assert_eq!(registry.get(book)?.config().creators, vec![key_set(["title"])]);

    let scope = Scope::new(
        &registry,
        Some("extended"),
        [
            (
                FixTarget::Type(book),
                ConfigFix::new().creators([key_set(["author"])]).creators_autoconfig(true),
            ),
            (
                FixTarget::Type(author),
                ConfigFix::new().getters([key_set(["books"])]).getters_autoconfig(true),
            ),
        ],
    )?;

    // 1. Required keys are injected into the configured creator group
    let scoped_book = registry.get(scope.get(book)?)?;
    assert_eq!(scoped_book.config().creators, vec![key_set(["author", "title"])]);

    // 2. Unique combinations are added after the configured getters
    let scoped_author = registry.get(scope.get(author)?)?;
    assert_eq!(
        scoped_author.config().getters,
        vec![key_set(["books"]), key_set(["name"])]
    );
    Ok(())
}

#[test]
fn test_get_all_keeps_order_and_reports_unknown_names() -> Result<()> {
    let registry = registry()?;
    let author = registry.find("author")?;
    let book = registry.find("book")?;
    let scope = Scope::new(&registry, Some("s"), Vec::new())?;

    let derived = scope.get_all(&[book, author])?;
    assert_eq!(derived, vec![scope.get(book)?, scope.get(author)?]);

    assert_eq!(
        scope.get_by_name("missing").unwrap_err(),
        EngineError::UnknownType("missing".to_string())
    );
    Ok(())
}

#[test]
fn test_graph_on_scoped_types_stays_in_scope() -> Result<()> {
    let registry = registry()?;
    let scope = Scope::new(&registry, Some("import"), Vec::new())?;
    let book = scope.get_by_name("book")?;

    let mut graph = Graph::new(&registry);
    let item = graph.create_with(book, [("author__name", "Ursula")])?;

    let author = graph.get(item, "author")?.and_then(|n| n.as_entity()).unwrap();
    let author_type = registry.get(graph.type_of(author)?)?;
    assert_eq!(author_type.name(), "author@import");
    assert_eq!(author_type.scope(), Some("import"));

    let books = graph.get(author, "books")?.and_then(|n| n.as_collection()).unwrap();
    assert_eq!(graph.members(books)?, &[item]);
    Ok(())
}

#[test]
fn test_clearing_the_registry_frees_scope_ids() -> Result<()> {
    let registry = registry()?;
    Scope::new(&registry, Some("once"), Vec::new())?;
    assert_eq!(
        Scope::new(&registry, Some("once"), Vec::new()).unwrap_err(),
        EngineError::DuplicateScopeId("once".to_string())
    );

    registry.clear();
    assert!(registry.is_empty());
    Scope::new(&registry, Some("once"), Vec::new())?;
    Ok(())
}

#[test]
fn test_scoped_configuration_drives_persisting() -> Result<()> {
    let mut db = MemoryBackend::new();
    db.create_model(
        ModelSchema::new("author").column(Column::new("name", ColumnType::String).unique()),
    )?;
    db.create_model(
        ModelSchema::new("book").column(Column::new("title", ColumnType::String).not_null()),
    )?;
    db.relate(
        "book",
        RelationColumn::new("author", "author", RelationKind::ManyToOne).reverse("books"),
    )?;

    let registry = TypeRegistry::new();
    let models = registry.register_models(&db, &["author", "book"])?;
    let author = models[0];

    // Authors are only looked up inside this scope
    let scope = Scope::new(
        &registry,
        Some("lookup-authors"),
        [(
            FixTarget::Type(author),
            ConfigFix::new().get_only(true).getters([key_set(["name"])]),
        )],
    )?;

    let mut graph = Graph::new(&registry);
    let book = graph.create_with(scope.get_by_name("book")?, [
        ("title", "The Dispossessed"),
        ("author__name", "Ursula K. Le Guin"),
    ])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, book)?;

    assert_eq!(outcome.items, vec![book]);
    assert_eq!(outcome.dropped.len(), 1);
    assert_eq!(outcome.dropped[0].reason, DropReason::GetOnlyMode);
    assert_eq!(outcome.dropped[0].type_name, "author@lookup-authors");
    assert_eq!(db.count("author")?, 0);
    assert_eq!(db.count("book")?, 1);

    // The base types are untouched by the scope
    let mut graph = Graph::new(&registry);
    let book = graph.create_with(models[1], [
        ("title", "Lathe of Heaven"),
        ("author__name", "Ursula K. Le Guin"),
    ])?;
    Persister::new(&mut db).persist(&mut graph, book)?;
    assert_eq!(db.count("author")?, 1);
    assert!(matches!(graph.peek(book, "author")?, Some(Node::Entity(_))));
    Ok(())
}
