mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use batchflow_engine::{ComponentRegistry, ExecutionContext, InterruptFlag, InvocationStatus, Runtime};
use batchflow_types::{Row, Value};
use common::{
    CollectingReporter, InMemoryBroker, RecordingDriver, RecordingTransactions, registry_from_yaml, runtime_with,
};

const ORDERS_BATCH: &str = r#"
- service: import
  steps:
    - kind: batch
      name: load
      input_folder: $inbox
      access: read_write
      interruptible: true
      processor:
        input:
          from: file
          file_name: "orders*.csv"
          header: true
          columns:
            - { name: id, type: integer, required: true }
            - { name: customer }
        before_children:
          kind: logic
          logic: record
      on_invalid_row:
        kind: logic
        logic: invalid
"#;

fn write_file(folder: &Path, name: &str, content: &str) {
    fs::write(folder.join(name), content).expect("write input file");
}

fn context_for(folder: &Path) -> ExecutionContext {
    let mut context = ExecutionContext::new();
    context.set_value("inbox", folder.to_string_lossy().into_owned());
    context
}

/// Registers `record`, which collects driver ids, and `invalid`, which counts
/// invalid rows. `record` fails for the id in `fail_on`.
fn orders_registry(fail_on: Option<i64>) -> (ComponentRegistry, Arc<Mutex<Vec<i64>>>, Arc<AtomicUsize>) {
    let mut registry = registry_from_yaml(ORDERS_BATCH);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let invalid = Arc::new(AtomicUsize::new(0));

    let recorded = Arc::clone(&seen);
    registry.register_logic_fn("record", move |context: &mut ExecutionContext| {
        let id = context.value("id").and_then(Value::as_integer).unwrap_or_default();
        if Some(id) == fail_on {
            bail!("order {id} cannot be imported");
        }
        recorded.lock().expect("seen lock").push(id);
        Ok(Value::Boolean(true))
    });
    let counted = Arc::clone(&invalid);
    registry.register_logic_fn("invalid", move |_context: &mut ExecutionContext| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Boolean(true))
    });
    (registry, seen, invalid)
}

#[test]
fn invalid_row_goes_to_the_handler_and_valid_rows_commit() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "id,customer\n1,acme\n2,globex\nthree,initech\n4,umbrella\n5,hooli\n");
    let (registry, seen, invalid) = orders_registry(None);
    let driver = RecordingDriver::new();
    let runtime = runtime_with(&registry, driver.clone());
    let mut context = context_for(inbox.path());

    let status = runtime.invoke("import", &mut context).expect("invoke import");

    assert_eq!(status, InvocationStatus::Completed);
    assert_eq!(invalid.load(Ordering::SeqCst), 1, "handler runs once for the invalid row");
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 4, 5]);
    assert_eq!(driver.count("read_write:commit"), 4);
    assert_eq!(context.value("loadResult"), Some(&Value::Integer(4)));
}

#[test]
fn failing_row_rolls_back_and_the_run_continues() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "id,customer\n1,a\n2,b\n3,c\n4,d\n5,e\n");
    let (registry, seen, invalid) = orders_registry(Some(3));
    let driver = RecordingDriver::new();
    let runtime = runtime_with(&registry, driver.clone());
    let mut context = context_for(inbox.path());

    runtime.invoke("import", &mut context).expect("invoke import");

    assert_eq!(invalid.load(Ordering::SeqCst), 0);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 4, 5]);
    assert_eq!(driver.count("read_write:commit"), 4);
    // One rollback for the failed row, one when the run closes its connection.
    assert_eq!(driver.count("read_write:rollback"), 2);
    assert_eq!(context.value("loadResult"), Some(&Value::Integer(4)));
}

#[test]
fn failed_commit_rolls_the_row_back_and_the_run_continues() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "id,customer\n1,a\n2,b\n3,c\n4,d\n");
    let (registry, seen, _) = orders_registry(None);
    let driver = RecordingDriver::failing_commit(2);
    let reporter = CollectingReporter::new();
    let runtime = runtime_with(&registry, driver.clone()).with_error_reporter(reporter.clone());
    let mut context = context_for(inbox.path());

    let status = runtime.invoke("import", &mut context).expect("invoke import");

    assert_eq!(status, InvocationStatus::Completed);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(driver.count("read_write:commit"), 4);
    // One rollback after the failed commit, one when the run closes its connection.
    assert_eq!(driver.count("read_write:rollback"), 2);
    assert_eq!(context.value("loadResult"), Some(&Value::Integer(3)));
    let reports = reporter.reports();
    assert_eq!(reports.len(), 1, "reports: {reports:?}");
    assert!(reports[0].contains("commit 2 failed"), "reports: {reports:?}");
}

#[test]
fn user_transaction_manager_owns_each_row_boundary() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "id,customer\n1,a\n2,b\n3,c\n");
    let mut registry = registry_from_yaml(
        r#"
- service: import
  steps:
    - kind: batch
      name: load
      input_folder: $inbox
      access: read_write
      user_transaction: true
      processor:
        input:
          from: file
          file_name: orders.csv
          header: true
          columns:
            - { name: id, type: integer }
            - { name: customer }
        before_children:
          kind: logic
          logic: reject_two
"#,
    );
    registry.register_logic_fn("reject_two", |context: &mut ExecutionContext| {
        if context.value("id") == Some(&Value::Integer(2)) {
            bail!("order 2 is rejected");
        }
        Ok(Value::Boolean(true))
    });
    let driver = RecordingDriver::new();
    let transactions = RecordingTransactions::new();
    let runtime = runtime_with(&registry, driver.clone()).with_user_transactions(transactions.clone());
    let mut context = context_for(inbox.path());

    runtime.invoke("import", &mut context).expect("invoke import");

    assert_eq!(
        transactions.events(),
        vec!["begin", "commit", "begin", "rollback", "begin", "commit"]
    );
    assert_eq!(driver.count("read_write:commit"), 0, "rows never commit the connection directly");
    assert_eq!(context.value("loadResult"), Some(&Value::Integer(2)));
}

#[test]
fn every_matching_file_gets_its_own_run() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders-a.csv", "id,customer\n1,a\n");
    write_file(inbox.path(), "orders-b.csv", "id,customer\n2,b\n3,c\n");
    write_file(inbox.path(), "returns.csv", "id,customer\n9,z\n");
    let (registry, seen, _) = orders_registry(None);
    let driver = RecordingDriver::new();
    let runtime = runtime_with(&registry, driver.clone());
    let mut context = context_for(inbox.path());

    runtime.invoke("import", &mut context).expect("invoke import");

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(driver.count("read_write:open"), 2);
    assert_eq!(context.value("loadResult"), Some(&Value::Integer(3)));
}

#[test]
fn raised_interrupt_ends_the_batch_before_the_first_row() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "id,customer\n1,a\n2,b\n");
    let (registry, seen, _) = orders_registry(None);
    let interrupt = InterruptFlag::new();
    interrupt.raise();
    let runtime = Runtime::prepare(&registry, RecordingDriver::new())
        .expect("prepare runtime")
        .with_interrupt_flag(interrupt);
    let mut context = context_for(inbox.path());

    let status = runtime.invoke("import", &mut context).expect("invoke import");

    assert_eq!(status, InvocationStatus::Completed);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(context.value("loadResult"), Some(&Value::Integer(0)));
}

#[test]
fn child_aggregates_restart_for_every_parent() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "1\n2\n3\n");
    write_file(inbox.path(), "lines.csv", "1;10\n1;5\n3;7\n");
    let mut registry = registry_from_yaml(
        r#"
- service: totals
  steps:
    - kind: batch
      name: sum
      input_folder: $inbox
      processor:
        input:
          from: file
          file_name: orders.csv
          columns:
            - { name: id, type: integer }
        children:
          - input:
              from: file
              file_name: lines.csv
              delimiter: ";"
              columns:
                - { name: order_id, type: integer }
                - { name: amount, type: integer }
            link:
              child_fields: [order_id]
              parent_fields: [id]
            aggregators:
              - { function: sum, input_field: amount, output_field: orderTotal }
              - { function: count, output_field: lineCount }
        after_children:
          kind: logic
          logic: collect
"#,
    );
    let totals = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&totals);
    registry.register_logic_fn("collect", move |context: &mut ExecutionContext| {
        collected.lock().expect("totals lock").push((
            context.value_or_null("id"),
            context.value_or_null("orderTotal"),
            context.value_or_null("lineCount"),
        ));
        Ok(Value::Boolean(true))
    });
    let runtime = runtime_with(&registry, RecordingDriver::new());
    let mut context = context_for(inbox.path());

    runtime.invoke("totals", &mut context).expect("invoke totals");

    assert_eq!(
        *totals.lock().unwrap(),
        vec![
            (Value::Integer(1), Value::Integer(15), Value::Integer(2)),
            (Value::Integer(2), Value::Integer(0), Value::Integer(0)),
            (Value::Integer(3), Value::Integer(7), Value::Integer(1)),
        ]
    );
}

#[test]
fn driver_aggregates_read_the_driver_row_not_the_last_child_row() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "1;100\n2;200\n");
    write_file(inbox.path(), "lines.csv", "1;7\n2;9\n");
    let registry = registry_from_yaml(
        r#"
- service: totals
  steps:
    - kind: batch
      name: sum
      input_folder: $inbox
      processor:
        input:
          from: file
          file_name: orders.csv
          delimiter: ";"
          columns:
            - { name: id, type: integer }
            - { name: amount, type: integer }
        aggregators:
          - { function: sum, input_field: amount, output_field: grandTotal }
        children:
          - input:
              from: file
              file_name: lines.csv
              delimiter: ";"
              columns:
                - { name: id, type: integer }
                - { name: amount, type: integer }
            link:
              child_fields: [id]
              parent_fields: [id]
            aggregators:
              - { function: sum, input_field: amount, output_field: lineTotal }
"#,
    );
    let runtime = runtime_with(&registry, RecordingDriver::new());
    let mut context = context_for(inbox.path());

    runtime.invoke("totals", &mut context).expect("invoke totals");

    assert_eq!(context.value("grandTotal"), Some(&Value::Integer(300)));
    assert_eq!(context.value("lineTotal"), Some(&Value::Integer(9)));
}

#[test]
fn unlinked_child_reads_one_row_per_parent() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "1\n2\n3\n");
    write_file(inbox.path(), "notes.csv", "first\nsecond\n");
    let mut registry = registry_from_yaml(
        r#"
- service: pairing
  steps:
    - kind: batch
      input_folder: $inbox
      processor:
        input:
          from: file
          file_name: orders.csv
          columns:
            - { name: id, type: integer }
        children:
          - input:
              from: file
              file_name: notes.csv
              columns:
                - { name: note }
            aggregators:
              - { function: count, output_field: picked }
        after_children:
          kind: logic
          logic: collect
"#,
    );
    let pairs = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&pairs);
    registry.register_logic_fn("collect", move |context: &mut ExecutionContext| {
        collected.lock().expect("pairs lock").push((
            context.value_or_null("id"),
            context.value_or_null("note"),
            context.value_or_null("picked"),
        ));
        Ok(Value::Boolean(true))
    });
    let runtime = runtime_with(&registry, RecordingDriver::new());
    let mut context = context_for(inbox.path());

    runtime.invoke("pairing", &mut context).expect("invoke pairing");

    let pairs = pairs.lock().unwrap();
    assert_eq!(pairs.len(), 3);
    assert_eq!(pairs[0], (Value::Integer(1), Value::from("first"), Value::Integer(1)));
    assert_eq!(pairs[1], (Value::Integer(2), Value::from("second"), Value::Integer(1)));
    assert_eq!(pairs[2].2, Value::Integer(0), "the child file ran out before the third parent");
}

#[test]
fn merge_skips_child_rows_that_sort_before_their_parent() {
    let inbox = tempfile::tempdir().expect("tempdir");
    write_file(inbox.path(), "orders.csv", "1\n2\n");
    write_file(inbox.path(), "lines.csv", "0;5\n1;10\n2;3\n");
    let mut registry = registry_from_yaml(
        r#"
- service: totals
  steps:
    - kind: batch
      input_folder: $inbox
      processor:
        input:
          from: file
          file_name: orders.csv
          columns:
            - { name: id, type: integer }
        children:
          - input:
              from: file
              file_name: lines.csv
              delimiter: ";"
              columns:
                - { name: order_id, type: integer }
                - { name: amount, type: integer }
            link:
              child_fields: [order_id]
              parent_fields: [id]
            aggregators:
              - { function: sum, input_field: amount, output_field: orderTotal }
        after_children:
          kind: logic
          logic: collect
"#,
    );
    let totals = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&totals);
    registry.register_logic_fn("collect", move |context: &mut ExecutionContext| {
        collected
            .lock()
            .expect("totals lock")
            .push((context.value_or_null("id"), context.value_or_null("orderTotal")));
        Ok(Value::Boolean(true))
    });
    let runtime = runtime_with(&registry, RecordingDriver::new());
    let mut context = context_for(inbox.path());

    runtime.invoke("totals", &mut context).expect("invoke totals");

    assert_eq!(
        *totals.lock().unwrap(),
        vec![
            (Value::Integer(1), Value::Integer(10)),
            (Value::Integer(2), Value::Integer(3)),
        ]
    );
}

#[test]
fn sheet_driver_feeds_a_sheet_sink() {
    let registry = registry_from_yaml(
        r#"
- service: copy
  steps:
    - kind: create_sheet
      sheet: source
      columns: [code, qty]
      rows:
        - [A, "2"]
        - [B, "x"]
        - [C, "4"]
    - kind: batch
      name: transfer
      processor:
        input:
          from: sheet
          sheet: source
          columns:
            - { name: code }
            - { name: qty, type: integer }
        output:
          to: sheet
          sheet: copied
          columns: [code, qty]
"#,
    );
    let runtime = runtime_with(&registry, RecordingDriver::new());
    let mut context = ExecutionContext::new();

    runtime.invoke("copy", &mut context).expect("invoke copy");

    let copied = context.sheet("copied").expect("copied sheet");
    assert_eq!(copied.len(), 2, "the row with a non-numeric qty is invalid");
    assert_eq!(copied.value(0, "code"), Some(&Value::Text("A".into())));
    assert_eq!(copied.value(1, "qty"), Some(&Value::Integer(4)));
    assert_eq!(context.value("transferResult"), Some(&Value::Integer(2)));
}

#[test]
fn service_managed_queue_commits_with_each_row() {
    let mut registry = registry_from_yaml(
        r#"
- service: drain
  steps:
    - kind: batch
      name: consume
      queue: service_managed
      processor:
        input:
          from: queue
          queue: orders
          columns:
            - { name: id, type: integer, required: true }
        before_children:
          kind: logic
          logic: reject_two
"#,
    );
    registry.register_logic_fn("reject_two", |context: &mut ExecutionContext| {
        if context.value("id") == Some(&Value::Integer(2)) {
            bail!("order 2 is rejected");
        }
        Ok(Value::Boolean(true))
    });
    let rows: Vec<Row> = (1..=3)
        .map(|id| Row::from([("id".to_string(), Value::Text(id.to_string()))]))
        .collect();
    let broker = InMemoryBroker::with_rows(rows);
    let runtime = runtime_with(&registry, RecordingDriver::new()).with_message_broker(broker.clone());
    let mut context = ExecutionContext::new();

    runtime.invoke("drain", &mut context).expect("invoke drain");

    assert_eq!(broker.events(), vec!["borrow", "commit", "rollback", "commit", "return"]);
    assert_eq!(context.value("consumeResult"), Some(&Value::Integer(2)));
}

#[test]
fn queue_batch_without_a_broker_is_a_configuration_error() {
    let registry = registry_from_yaml(
        r#"
- service: drain
  steps:
    - kind: batch
      queue: externally_managed
      processor:
        input:
          from: queue
          queue: orders
"#,
    );
    let runtime = runtime_with(&registry, RecordingDriver::new());
    let mut context = ExecutionContext::new();

    let error = runtime.invoke("drain", &mut context).expect_err("no broker configured");
    assert!(error.is_configuration());
}

#[test]
fn linked_driver_is_rejected_at_prepare() {
    let registry = registry_from_yaml(
        r#"
- service: broken
  steps:
    - kind: batch
      processor:
        input:
          from: sheet
          sheet: rows
        link:
          child_fields: [a]
          parent_fields: [a]
"#,
    );
    let error = Runtime::prepare(&registry, RecordingDriver::new()).expect_err("link on driver must fail");
    assert!(error.is_configuration());
}
