use std::cell::RefCell;
use std::rc::Rc;

use graphpersist::storage::{Column, ModelSchema, RelationColumn};
use graphpersist::{
    ColumnType, ConfigFix, DropReason, DroppedItem, EngineError, EntityTypeBuilder, FixTarget,
    Graph, MemoryBackend, PersistConfig, PersistOutcome, Persister, RecordRef, RelationKind,
    Result, Scope, TypeRegistry, Value, key_set,
};

fn library_db(author_required: bool) -> Result<MemoryBackend> {
    let mut db = MemoryBackend::new();
    db.create_model(
        ModelSchema::new("author")
            .column(Column::new("name", ColumnType::String).unique())
            .column(Column::new("country", ColumnType::String)),
    )?;
    db.create_model(
        ModelSchema::new("book")
            .column(Column::new("title", ColumnType::String).not_null())
            .column(Column::new("isbn", ColumnType::String).unique()),
    )?;
    db.create_model(ModelSchema::new("tag").column(Column::new("label", ColumnType::String).unique()))?;

    let mut author = RelationColumn::new("author", "author", RelationKind::ManyToOne).reverse("books");
    if author_required {
        author = author.required();
    }
    db.relate("book", author)?;
    db.relate(
        "book",
        RelationColumn::new("tags", "tag", RelationKind::ManyToMany).reverse("books"),
    )?;
    Ok(db)
}

fn library() -> Result<(MemoryBackend, TypeRegistry)> {
    let db = library_db(false)?;
    let registry = TypeRegistry::new();
    registry.register_models(&db, &["author", "book", "tag"])?;
    Ok((db, registry))
}

fn book(id: i64) -> RecordRef {
    RecordRef::new("book", id)
}

fn author(id: i64) -> RecordRef {
    RecordRef::new("author", id)
}

fn tag(id: i64) -> RecordRef {
    RecordRef::new("tag", id)
}

fn column(db: &MemoryBackend, record: &RecordRef, name: &str) -> Value {
    db.fetch(record).unwrap().get(name).cloned().unwrap_or(Value::Null)
}

/// Persists a book with its author and tags through a fresh graph.
fn persist_book(
    db: &mut MemoryBackend,
    registry: &TypeRegistry,
    title: &str,
    isbn: &str,
    author_name: &str,
    labels: &[&str],
) -> Result<PersistOutcome> {
    let mut graph = Graph::new(registry);
    let item = graph.create_with(registry.find("book")?, [
        ("title", title),
        ("isbn", isbn),
        ("author__name", author_name),
    ])?;
    let mut tags = Vec::new();
    for label in labels {
        tags.push(graph.create_with(registry.find("tag")?, [("label", *label)])?);
    }
    graph.set(item, "tags", tags)?;
    Persister::new(db).persist(&mut graph, item)
}

#[test]
fn test_nested_graph_is_created_and_linked() -> Result<()> {
    let (mut db, registry) = library()?;

    let outcome = persist_book(&mut db, &registry, "Earthsea", "1", "Le Guin", &["fantasy", "classic"])?;

    assert!(outcome.dropped.is_empty());
    assert_eq!(outcome.records, vec![vec![book(1)]]);
    assert_eq!(db.count("book")?, 1);
    assert_eq!(db.count("author")?, 1);
    assert_eq!(db.count("tag")?, 2);
    assert_eq!(column(&db, &book(1), "title"), Value::from("Earthsea"));
    assert_eq!(db.related_records(&book(1), "author")?, vec![author(1)]);
    assert_eq!(db.related_records(&author(1), "books")?, vec![book(1)]);
    assert_eq!(db.related_records(&book(1), "tags")?, vec![tag(1), tag(2)]);
    assert_eq!(db.related_records(&tag(2), "books")?, vec![book(1)]);
    Ok(())
}

#[test]
fn test_found_records_are_reused() -> Result<()> {
    let (mut db, registry) = library()?;
    persist_book(&mut db, &registry, "Earthsea", "1", "Le Guin", &["fantasy"])?;

    let outcome = persist_book(&mut db, &registry, "Tehanu", "2", "Le Guin", &["fantasy", "sequel"])?;

    assert_eq!(outcome.records, vec![vec![book(2)]]);
    assert_eq!(db.count("author")?, 1);
    assert_eq!(db.count("tag")?, 2);
    assert_eq!(db.related_records(&author(1), "books")?, vec![book(1), book(2)]);
    assert_eq!(db.related_records(&tag(1), "books")?, vec![book(1), book(2)]);
    assert_eq!(db.related_records(&tag(2), "books")?, vec![book(2)]);
    Ok(())
}

#[test]
fn test_primary_key_lookup_updates_in_place() -> Result<()> {
    let (mut db, registry) = library()?;
    persist_book(&mut db, &registry, "Earthsea", "1", "Le Guin", &[])?;

    let mut graph = Graph::new(&registry);
    let item = graph.create_with(registry.find("book")?, [
        ("id", Value::Integer(1)),
        ("title", Value::from("A Wizard of Earthsea")),
    ])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, item)?;

    assert_eq!(outcome.records_of(item), Some(&[book(1)][..]));
    assert_eq!(db.count("book")?, 1);
    assert_eq!(column(&db, &book(1), "title"), Value::from("A Wizard of Earthsea"));
    // Keys the entity does not hold are left alone
    assert_eq!(column(&db, &book(1), "isbn"), Value::from("1"));
    assert_eq!(db.related_records(&book(1), "author")?, vec![author(1)]);
    Ok(())
}

#[test]
fn test_missing_data_drops_only_the_child() -> Result<()> {
    let (mut db, registry) = library()?;
    let mut graph = Graph::new(&registry);
    let writer = graph.create_with(registry.find("author")?, [("name", "Le Guin")])?;
    let untitled = graph.create_with(registry.find("book")?, [("isbn", "3")])?;
    graph.set(writer, "books", vec![untitled])?;

    let outcome = Persister::new(&mut db).persist(&mut graph, writer)?;

    assert_eq!(outcome.items, vec![writer]);
    assert_eq!(
        outcome.dropped,
        vec![DroppedItem {
            item: untitled,
            type_name: "book".to_string(),
            reason: DropReason::NotEnoughData,
        }]
    );
    assert_eq!(db.count("author")?, 1);
    assert_eq!(db.count("book")?, 0);
    assert!(db.related_records(&author(1), "books")?.is_empty());
    Ok(())
}

#[test]
fn test_collection_members_are_persisted_independently() -> Result<()> {
    let (mut db, registry) = library()?;
    let book_type = registry.find("book")?;
    let mut graph = Graph::new(&registry);
    let good = graph.create_with(book_type, [("title", "Dune")])?;
    let bad = graph.create_with(book_type, [("isbn", "4")])?;
    let batch = graph.create_collection(book_type)?;
    graph.add_all(batch, &[bad, good])?;

    let outcome = Persister::new(&mut db).persist(&mut graph, batch)?;

    assert_eq!(outcome.items, vec![good]);
    assert!(outcome.is_dropped(bad));
    assert_eq!(outcome.records_of(bad), None);
    let (items, records) = outcome.into_parts();
    assert_eq!(items, vec![good]);
    assert_eq!(records, vec![vec![book(1)]]);
    Ok(())
}

#[test]
fn test_update_only_never_creates() -> Result<()> {
    let (mut db, registry) = library()?;
    persist_book(&mut db, &registry, "Earthsea", "1", "Le Guin", &[])?;
    let book_type = registry.find("book")?;

    let mut graph = Graph::new(&registry);
    let unknown = graph.create_with(book_type, [("title", "Unknown"), ("isbn", "99")])?;
    let known = graph.create_with(book_type, [("title", "Earthsea, revised"), ("isbn", "1")])?;
    graph.set_update_only(unknown, Some(true))?;
    graph.set_update_only(known, Some(true))?;
    let batch = graph.create_collection(book_type)?;
    graph.add_all(batch, &[unknown, known])?;

    let outcome = Persister::new(&mut db).persist(&mut graph, batch)?;

    assert_eq!(outcome.items, vec![known]);
    assert_eq!(outcome.dropped[0].reason, DropReason::UpdateOnlyMode);
    assert_eq!(db.count("book")?, 1);
    assert_eq!(column(&db, &book(1), "title"), Value::from("Earthsea, revised"));
    Ok(())
}

#[test]
fn test_get_only_entities_are_looked_up_but_never_written() -> Result<()> {
    let (mut db, registry) = library()?;
    let mut graph = Graph::new(&registry);
    let original = graph.create_with(registry.find("author")?, [("name", "Le Guin"), ("country", "US")])?;
    Persister::new(&mut db).persist(&mut graph, original)?;

    let mut graph = Graph::new(&registry);
    let item = graph.create_with(registry.find("book")?, [
        ("title", "Tehanu"),
        ("author__name", "Le Guin"),
        ("author__country", "XX"),
    ])?;
    let writer = graph.peek(item, "author")?.and_then(|n| n.as_entity()).unwrap();
    graph.set_get_only(writer, Some(true))?;
    let stranger = graph.create_with(registry.find("author")?, [("name", "Nobody")])?;
    graph.set_get_only(stranger, Some(true))?;
    let batch = graph.create_collection(registry.find("author")?)?;
    graph.add_all(batch, &[writer, stranger])?;

    let outcome = Persister::new(&mut db).persist(&mut graph, batch)?;

    assert_eq!(outcome.items, vec![writer]);
    assert_eq!(outcome.records_of(writer), Some(&[author(1)][..]));
    assert!(outcome.is_dropped(stranger));
    assert_eq!(db.count("author")?, 1);
    assert_eq!(column(&db, &author(1), "country"), Value::from("US"));
    // Nothing links to a get-only record either
    assert!(db.related_records(&author(1), "books")?.is_empty());
    Ok(())
}

#[test]
fn test_ambiguous_lookups_fail_unless_merging_is_allowed() -> Result<()> {
    let (mut db, registry) = library()?;
    let author_type = registry.find("author")?;
    let mut graph = Graph::new(&registry);
    let batch = graph.create_collection(author_type)?;
    for name in ["Tolkien", "Pratchett"] {
        graph.generate(batch, [("name", name), ("country", "UK")])?;
    }
    Persister::new(&mut db).persist(&mut graph, batch)?;
    assert_eq!(db.count("author")?, 2);

    // 1. Several matches are a failure by default
    let by_country = Scope::new(
        &registry,
        Some("by-country"),
        [(FixTarget::Type(author_type), ConfigFix::new().getters([key_set(["country"])]))],
    )?;
    let mut graph = Graph::new(&registry);
    let british = graph.create_with(by_country.get(author_type)?, [("country", "UK")])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, british)?;

    assert!(outcome.items.is_empty());
    assert_eq!(outcome.dropped[0].reason, DropReason::AmbiguousMatchNotAllowed);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].item, british);
    assert_eq!(outcome.failures[0].records, vec![author(1), author(2)]);
    assert_eq!(db.count("author")?, 2);

    // 2. Merging resolves to every match and updates them all
    let merging = Scope::new(
        &registry,
        Some("merging"),
        [(
            FixTarget::Type(author_type),
            ConfigFix::new()
                .getters([key_set(["country"])])
                .allow_merge_items(true),
        )],
    )?;
    let mut graph = Graph::new(&registry);
    let british = graph.create_with(merging.get(author_type)?, [("country", "UK")])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, british)?;

    assert_eq!(outcome.records_of(british), Some(&[author(1), author(2)][..]));
    assert!(outcome.failures.is_empty());
    Ok(())
}

#[test]
fn test_one_record_claimed_twice() -> Result<()> {
    let (mut db, registry) = library()?;
    let book_type = registry.find("book")?;

    // 1. The second entity finds the record created for the first one
    let mut graph = Graph::new(&registry);
    let batch = graph.create_collection(book_type)?;
    let first = graph.generate(batch, [("title", "First"), ("isbn", "1")])?;
    let second = graph.generate(batch, [("title", "Second"), ("isbn", "1")])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, batch)?;

    assert_eq!(outcome.items, vec![first]);
    assert!(outcome.is_dropped(second));
    assert_eq!(outcome.failures[0].item, second);
    assert_eq!(column(&db, &book(1), "title"), Value::from("First"));

    // 2. Shared updates are allowed per type
    let shared = Scope::new(
        &registry,
        Some("shared"),
        [(FixTarget::Type(book_type), ConfigFix::new().allow_multi_update(true))],
    )?;
    let shared_book = shared.get(book_type)?;
    let mut graph = Graph::new(&registry);
    let batch = graph.create_collection(shared_book)?;
    let first = graph.generate(batch, [("title", "Again"), ("isbn", "1")])?;
    let second = graph.generate(batch, [("title", "Last"), ("isbn", "1")])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, batch)?;

    assert_eq!(outcome.items, vec![first, second]);
    assert_eq!(outcome.records, vec![vec![book(1)], vec![book(1)]]);
    assert_eq!(db.count("book")?, 1);
    assert_eq!(column(&db, &book(1), "title"), Value::from("Last"));
    Ok(())
}

#[test]
fn test_replace_x_to_many_replaces_links() -> Result<()> {
    let mut db = library_db(false)?;
    let adding = TypeRegistry::new();
    adding.register_models(&db, &["author", "book", "tag"])?;
    persist_book(&mut db, &adding, "Earthsea", "1", "Le Guin", &["fantasy", "classic"])?;

    let replacing = TypeRegistry::new();
    replacing.register_models(&db, &["author", "tag"])?;
    replacing.register(EntityTypeBuilder::from_backend(&db, "book")?.replace_x_to_many("tags"))?;

    let retag = |db: &mut MemoryBackend, registry: &TypeRegistry, label: &str| -> Result<()> {
        let mut graph = Graph::new(registry);
        let item = graph.create_with(registry.find("book")?, [("id", 1)])?;
        let tag = graph.create_with(registry.find("tag")?, [("label", label)])?;
        graph.set(item, "tags", vec![tag])?;
        Persister::new(db).persist(&mut graph, item)?;
        Ok(())
    };

    retag(&mut db, &adding, "wizards")?;
    assert_eq!(db.related_records(&book(1), "tags")?, vec![tag(1), tag(2), tag(3)]);

    retag(&mut db, &replacing, "dragons")?;
    assert_eq!(db.related_records(&book(1), "tags")?, vec![tag(4)]);
    assert_eq!(db.count("tag")?, 4);
    Ok(())
}

#[test]
fn test_notifications_follow_persist_order() -> Result<()> {
    let (mut db, registry) = library()?;
    let book_type = registry.find("book")?;
    let mut graph = Graph::new(&registry);
    let batch = graph.create_collection(book_type)?;
    let good = graph.generate(batch, [("title", "Dune"), ("author__name", "Herbert")])?;
    let bad = graph.generate(batch, [("isbn", "5")])?;
    let writer = graph.peek(good, "author")?.and_then(|n| n.as_entity()).unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let resolved = Rc::new(RefCell::new(Vec::new()));
    let mut persister = Persister::new(&mut db);
    {
        let signals = persister.signals();
        let log = events.clone();
        signals.before_persist.subscribe(move |event| {
            log.borrow_mut()
                .push(format!("before {} {}", event.item, event.snapshot["item"]["title"]));
        });
        let log = events.clone();
        signals
            .dropped
            .subscribe(move |dropped| log.borrow_mut().push(format!("dropped {}", dropped.reason.as_str())));
        let log = events.clone();
        let seen = resolved.clone();
        signals.after_persist.subscribe(move |event| {
            log.borrow_mut().push(format!("after {}", event.item));
            seen.borrow_mut().push((event.resolved.clone(), event.records.clone()));
        });
    }

    persister.persist(&mut graph, batch)?;

    assert_eq!(
        *events.borrow(),
        vec![
            format!("before {} \"Dune\"", good),
            format!("before {} null", bad),
            "dropped not_enough_data".to_string(),
            format!("after {}", good),
            format!("after {}", bad),
        ]
    );
    // The book waits for its author; the dropped item reports nothing resolved
    assert_eq!(
        *resolved.borrow(),
        vec![(vec![writer, good], vec![author(1), book(1)]), (vec![], vec![])]
    );
    Ok(())
}

#[test]
fn test_unsubscribed_handlers_stay_silent() -> Result<()> {
    let (mut db, registry) = library()?;
    let calls = Rc::new(RefCell::new(0));
    let mut persister = Persister::new(&mut db);
    let counter = calls.clone();
    let id = persister
        .signals()
        .after_persist
        .subscribe(move |_| *counter.borrow_mut() += 1);

    let mut graph = Graph::new(&registry);
    let first = graph.create_with(registry.find("tag")?, [("label", "one")])?;
    persister.persist(&mut graph, first)?;
    assert!(persister.signals().after_persist.unsubscribe(id));
    let second = graph.create_with(registry.find("tag")?, [("label", "two")])?;
    persister.persist(&mut graph, second)?;

    assert_eq!(*calls.borrow(), 1);
    assert_eq!(persister.backend().count("tag")?, 2);
    Ok(())
}

#[test]
fn test_processing_can_be_disabled() -> Result<()> {
    let (mut db, registry) = library()?;
    let author_type = registry.find("author")?;
    let scope = Scope::new(
        &registry,
        Some("defaults"),
        [(FixTarget::Type(author_type), ConfigFix::new().default_value("country", "N/A"))],
    )?;
    let scoped = scope.get(author_type)?;

    let mut graph = Graph::new(&registry);
    let raw = graph.create_with(scoped, [("name", "Raw")])?;
    let snapshots = Rc::new(RefCell::new(Vec::new()));
    let mut persister = Persister::new(&mut db).with_config(
        PersistConfig::new()
            .process_items(false)
            .snapshot_before_persist(false),
    );
    let seen = snapshots.clone();
    persister
        .signals()
        .before_persist
        .subscribe(move |event| seen.borrow_mut().push(event.snapshot.clone()));
    persister.persist(&mut graph, raw)?;
    drop(persister);
    assert_eq!(*snapshots.borrow(), vec![serde_json::Value::Null]);

    let processed = graph.create_with(scoped, [("name", "Processed")])?;
    Persister::new(&mut db).persist(&mut graph, processed)?;

    assert_eq!(column(&db, &author(1), "country"), Value::Null);
    assert_eq!(column(&db, &author(2), "country"), Value::from("N/A"));
    Ok(())
}

#[test]
fn test_relation_groups_wait_for_their_targets() -> Result<()> {
    let mut db = library_db(true)?;
    let registry = TypeRegistry::new();
    registry.register_models(&db, &["author", "book", "tag"])?;
    assert_eq!(
        registry.by_name("book")?.config().creators,
        vec![key_set(["author", "title"])]
    );

    let mut graph = Graph::new(&registry);
    let item = graph.create_with(registry.find("book")?, [("title", "Dune"), ("author__name", "Herbert")])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, item)?;

    assert_eq!(outcome.items, vec![item]);
    assert_eq!(db.related_records(&book(1), "author")?, vec![author(1)]);
    Ok(())
}

#[test]
fn test_stalled_resolution_is_forced() -> Result<()> {
    let mut db = library_db(true)?;
    let registry = TypeRegistry::new();
    registry.register_models(&db, &["book", "tag"])?;
    // Authors are looked up through their books only
    registry.register(
        EntityTypeBuilder::from_backend(&db, "author")?.config(
            ConfigFix::new()
                .getters([key_set(["books"])])
                .creators(Vec::new()),
        ),
    )?;

    let mut graph = Graph::new(&registry);
    let item = graph.create_with(registry.find("book")?, [("title", "Dune"), ("author__name", "Herbert")])?;
    let writer = graph.peek(item, "author")?.and_then(|n| n.as_entity()).unwrap();
    let outcome = Persister::new(&mut db).persist(&mut graph, item)?;

    assert!(outcome.items.is_empty());
    assert_eq!(outcome.dropped[0].item, item);
    assert_eq!(outcome.dropped[0].reason, DropReason::NotEnoughData);
    assert!(!outcome.is_dropped(writer));
    assert_eq!(db.count("book")?, 0);
    assert_eq!(db.count("author")?, 1);
    Ok(())
}

#[test]
fn test_fast_insert_surfaces_backend_errors() -> Result<()> {
    let (mut db, registry) = library()?;
    let tag_type = registry.find("tag")?;
    let scope = Scope::new(
        &registry,
        Some("bulk-load"),
        [(FixTarget::Type(tag_type), ConfigFix::new().fast_insert(true))],
    )?;
    let fast_tag = scope.get(tag_type)?;

    let mut graph = Graph::new(&registry);
    let batch = graph.create_collection(fast_tag)?;
    graph.generate(batch, [("label", "dup")])?;
    graph.generate(batch, [("label", "dup")])?;
    let err = Persister::new(&mut db).persist(&mut graph, batch).unwrap_err();

    assert!(matches!(err, EngineError::ConstraintViolation(_)));
    assert_eq!(db.count("tag")?, 1);
    Ok(())
}

#[test]
fn test_repeated_runs_are_deterministic() -> Result<()> {
    fn run() -> Result<(PersistOutcome, Vec<Vec<RecordRef>>)> {
        let (mut db, registry) = library()?;
        let book_type = registry.find("book")?;
        let mut graph = Graph::new(&registry);
        let batch = graph.create_collection(book_type)?;
        let herbert = graph.create_with(registry.find("author")?, [("name", "Herbert")])?;
        let le_guin = graph.create_with(registry.find("author")?, [("name", "Le Guin")])?;
        let sf = graph.create_with(registry.find("tag")?, [("label", "sf")])?;
        let fantasy = graph.create_with(registry.find("tag")?, [("label", "fantasy")])?;
        for (title, writer, label) in [
            ("Dune", herbert, sf),
            ("Earthsea", le_guin, fantasy),
            ("Dune Messiah", herbert, sf),
            ("Tehanu", le_guin, fantasy),
        ] {
            let item = graph.generate(batch, [("title", title)])?;
            graph.set(item, "author", writer)?;
            graph.set(item, "tags", vec![label])?;
        }
        let outcome = Persister::new(&mut db).persist(&mut graph, batch)?;

        let mut links = Vec::new();
        for record in db.records("book")? {
            links.push(db.related_records(&record, "author")?);
            links.push(db.related_records(&record, "tags")?);
        }
        Ok((outcome, links))
    }

    let (first, first_links) = run()?;
    let (second, second_links) = run()?;
    assert_eq!(first, second);
    assert_eq!(first_links, second_links);
    assert_eq!(first.items.len(), 4);
    assert!(first.dropped.is_empty());
    // Dune waits for Herbert, so Dune Messiah, reached through Herbert's
    // books, is created first. Each book is created with its author.
    assert_eq!(first.records, vec![vec![book(3)], vec![book(4)], vec![book(1)], vec![book(2)]]);
    assert_eq!(first_links[0], vec![author(1)]);
    assert_eq!(first_links[1], vec![tag(1)]);
    assert_eq!(first_links[2], vec![author(2)]);
    assert_eq!(first_links[4], vec![author(1)]);
    assert_eq!(first_links[7], vec![tag(2)]);
    Ok(())
}

#[test]
fn test_persisting_twice_finds_what_was_created() -> Result<()> {
    let (mut db, registry) = library()?;
    let mut graph = Graph::new(&registry);
    let item = graph.create_with(registry.find("book")?, [
        ("title", "Dune"),
        ("isbn", "42"),
        ("author__name", "Herbert"),
    ])?;

    let first = Persister::new(&mut db).persist(&mut graph, item)?;
    let second = Persister::new(&mut db).persist(&mut graph, item)?;

    assert_eq!(first.records, second.records);
    assert_eq!(db.count("book")?, 1);
    assert_eq!(db.count("author")?, 1);
    assert_eq!(db.link_count(), 1);
    Ok(())
}

#[test]
fn test_records_are_created_with_their_single_links() -> Result<()> {
    let mut db = library_db(true)?;
    let registry = TypeRegistry::new();
    registry.register_models(&db, &["author", "tag"])?;
    // The creator group leaves out the required author
    registry.register(
        EntityTypeBuilder::from_backend(&db, "book")?.config(ConfigFix::new().creators([key_set(["title"])])),
    )?;
    assert_eq!(registry.by_name("book")?.config().creators, vec![key_set(["title"])]);

    let mut graph = Graph::new(&registry);
    let item = graph.create_with(registry.find("book")?, [("title", "Dune"), ("author__name", "Herbert")])?;
    let outcome = Persister::new(&mut db).persist(&mut graph, item)?;

    assert_eq!(outcome.items, vec![item]);
    assert!(outcome.dropped.is_empty());
    assert_eq!(db.related_records(&book(1), "author")?, vec![author(1)]);
    Ok(())
}

#[test]
fn test_protected_keys_of_found_records() -> Result<()> {
    let mut db = library_db(false)?;
    let registry = TypeRegistry::new();
    registry.register_models(&db, &["author", "tag"])?;
    registry.register(
        EntityTypeBuilder::from_backend(&db, "book")?.config(
            ConfigFix::new()
                .norewrite("title", Some(false))
                .norewrite("author", Some(true))
                .norewrite("isbn", None),
        ),
    )?;
    let book_type = registry.find("book")?;
    let mut save = |values: Vec<(&str, &str)>| -> Result<()> {
        let mut graph = Graph::new(&registry);
        let item = graph.create_with(book_type, values)?;
        Persister::new(&mut db).persist(&mut graph, item)?;
        Ok(())
    };

    // 1. A created record gets every key
    save(vec![("isbn", "1"), ("title", "Dune")])?;
    // 2. The title is never rewritten, the missing author is filled in
    save(vec![("isbn", "1"), ("title", "Dune, revised"), ("author__name", "Herbert")])?;
    // 3. A set author is kept
    save(vec![("isbn", "1"), ("author__name", "Anderson")])?;
    // 4. Protection does not apply to records created by the call
    save(vec![("isbn", "2"), ("title", "Emma"), ("author__name", "Herbert")])?;

    assert_eq!(column(&db, &book(1), "title"), Value::from("Dune"));
    assert_eq!(db.related_records(&book(1), "author")?, vec![author(1)]);
    assert_eq!(db.count("author")?, 2);
    assert_eq!(column(&db, &book(2), "title"), Value::from("Emma"));
    assert_eq!(db.related_records(&book(2), "author")?, vec![author(1)]);

    // 5. Fields protected through a scope only fill nulls
    let author_type = registry.find("author")?;
    let careful = Scope::new(
        &registry,
        Some("careful"),
        [(FixTarget::Type(author_type), ConfigFix::new().norewrite("country", Some(true)))],
    )?;
    let careful_author = careful.get(author_type)?;
    for country in [None, Some("US"), Some("XX")] {
        let mut graph = Graph::new(&registry);
        let item = graph.create_with(careful_author, [("name", "Le Guin")])?;
        if let Some(country) = country {
            graph.set(item, "country", country)?;
        }
        Persister::new(&mut db).persist(&mut graph, item)?;
    }
    assert_eq!(column(&db, &author(3), "country"), Value::from("US"));
    assert_eq!(db.count("author")?, 3);
    Ok(())
}

#[test]
fn test_sibling_items_are_merged_before_persisting() -> Result<()> {
    let (mut db, registry) = library()?;
    let book_type = registry.find("book")?;
    let merging = Scope::new(
        &registry,
        Some("merging"),
        [(FixTarget::Type(book_type), ConfigFix::new().getters([key_set(["isbn"])]).allow_merge_items(true))],
    )?;
    let merging_book = merging.get(book_type)?;

    let mut graph = Graph::new(&registry);
    let writer = graph.create_with(merging.get(registry.find("author")?)?, [("name", "Herbert")])?;
    let first = graph.create_with(merging_book, [("isbn", "7"), ("title", "Dune")])?;
    let second = graph.create_with(merging_book, [("isbn", "7")])?;
    let sf = graph.create_with(merging.get(registry.find("tag")?)?, [("label", "sf")])?;
    graph.set(second, "tags", vec![sf])?;
    graph.set(writer, "books", vec![first, second])?;

    let outcome = Persister::new(&mut db).persist(&mut graph, writer)?;

    assert!(outcome.dropped.is_empty());
    assert!(outcome.failures.is_empty());
    assert!(!graph.exists(second));
    assert_eq!(db.count("book")?, 1);
    assert_eq!(column(&db, &book(1), "title"), Value::from("Dune"));
    assert_eq!(db.related_records(&book(1), "tags")?, vec![tag(1)]);
    assert_eq!(db.related_records(&author(1), "books")?, vec![book(1)]);
    Ok(())
}
