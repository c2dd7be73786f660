mod common;

use batchflow_engine::{ComponentRegistry, ExecutionContext, InvocationStatus, NoopDriver, Runtime};
use batchflow_types::{MessageDefinition, MessageSeverity, Value};
use common::{RecordingDriver, registry_from_yaml, runtime_with};

fn prepare(registry: &ComponentRegistry) -> Runtime {
    Runtime::prepare(registry, NoopDriver::shared()).expect("prepare runtime")
}

#[test]
fn jump_skips_intermediate_steps() {
    let registry = registry_from_yaml(
        r#"
- service: jumps
  steps:
    - kind: set_value
      name: Init
      field: x
      value: 1
    - kind: jump_to
      name: Step1
      if: "x == 1"
      target: L3
    - kind: set_value
      name: Step2
      field: z
      value: 99
    - kind: set_value
      name: L3
      field: y
      value: 2
"#,
    );
    let runtime = prepare(&registry);
    let mut context = ExecutionContext::new();

    let status = runtime.invoke("jumps", &mut context).expect("invoke jumps");

    assert_eq!(status, InvocationStatus::Completed);
    assert_eq!(context.value("x"), Some(&Value::Integer(1)));
    assert_eq!(context.value("y"), Some(&Value::Integer(2)));
    assert!(context.value("z").is_none(), "Step2 must not run");
    assert!(context.value("Step2Result").is_none());
    assert_eq!(context.value("L3Result"), Some(&Value::Boolean(true)));
}

#[test]
fn false_precondition_leaves_context_untouched() {
    let registry = registry_from_yaml(
        r#"
- service: guarded
  steps:
    - kind: set_value
      name: maybe
      if: "enabled == true"
      field: touched
      value: yes
"#,
    );
    let runtime = prepare(&registry);
    let mut context = ExecutionContext::new();
    context.set_value("enabled", false);

    runtime.invoke("guarded", &mut context).expect("invoke guarded");

    assert!(context.value("touched").is_none());
    assert!(context.value("maybeResult").is_none());
    assert_eq!(context.fields().len(), 1);
}

#[test]
fn break_inside_nested_block_ends_the_enclosing_loop() {
    let mut registry = registry_from_yaml(
        r#"
- service: counter
  steps:
    - kind: set_value
      field: n
      value: 0
    - kind: loop
      name: repeat
      while: "n < 10"
      steps:
        - kind: logic
          logic: increment
        - kind: block
          if: "n == 3"
          steps:
            - kind: jump_to
              target: _break
    - kind: set_value
      field: after
      value: true
"#,
    );
    registry.register_logic_fn("increment", |context: &mut ExecutionContext| {
        let next = context.value("n").and_then(Value::as_integer).unwrap_or_default() + 1;
        context.set_value("n", next);
        Ok(Value::Boolean(true))
    });
    let runtime = prepare(&registry);
    let mut context = ExecutionContext::new();

    let status = runtime.invoke("counter", &mut context).expect("invoke counter");

    assert_eq!(status, InvocationStatus::Completed);
    assert_eq!(context.value("n"), Some(&Value::Integer(3)));
    assert_eq!(context.value("after"), Some(&Value::Boolean(true)));
}

#[test]
fn stop_in_nested_block_ends_the_invocation() {
    let registry = registry_from_yaml(
        r#"
- service: halting
  steps:
    - kind: block
      steps:
        - kind: block
          steps:
            - kind: jump_to
              target: _stop
    - kind: set_value
      field: unreachable
      value: 1
"#,
    );
    let runtime = prepare(&registry);
    let mut context = ExecutionContext::new();

    let status = runtime.invoke("halting", &mut context).expect("invoke halting");

    assert_eq!(status, InvocationStatus::Stopped);
    assert!(context.value("unreachable").is_none());
}

#[test]
fn sheet_loop_copies_columns_and_writes_back() {
    let mut registry = registry_from_yaml(
        r#"
- service: totals
  steps:
    - kind: create_sheet
      sheet: lines
      columns: [qty, price, total]
      rows:
        - [2, 5, null]
        - [3, 4, null]
    - kind: loop
      sheet: lines
      columns_to_fields: ["*"]
      fields_to_columns: [total]
      steps:
        - kind: logic
          logic: multiply
"#,
    );
    registry.register_logic_fn("multiply", |context: &mut ExecutionContext| {
        let qty = context.value("qty").and_then(Value::as_integer).unwrap_or_default();
        let price = context.value("price").and_then(Value::as_integer).unwrap_or_default();
        context.set_value("total", qty * price);
        Ok(Value::Boolean(true))
    });
    let runtime = prepare(&registry);
    let mut context = ExecutionContext::new();

    runtime.invoke("totals", &mut context).expect("invoke totals");

    let sheet = context.sheet("lines").expect("lines sheet");
    assert_eq!(sheet.value(0, "total"), Some(&Value::Integer(10)));
    assert_eq!(sheet.value(1, "total"), Some(&Value::Integer(12)));
}

#[test]
fn error_message_with_stop_flag_ends_the_invocation() {
    let mut registry = registry_from_yaml(
        r#"
- service: checked
  steps:
    - kind: set_value
      field: balance
      value: -5
      success_message: { name: overdrawn, params: [balance] }
      stop_if_message_is_error: true
    - kind: set_value
      field: after
      value: true
"#,
    );
    registry.add_message(
        "overdrawn",
        MessageDefinition {
            severity: MessageSeverity::Error,
            text: "balance {0} is below zero".to_string(),
        },
    );
    let runtime = prepare(&registry);
    let mut context = ExecutionContext::new();

    let status = runtime.invoke("checked", &mut context).expect("invoke checked");

    assert_eq!(status, InvocationStatus::Stopped);
    assert!(context.value("after").is_none());
    assert!(context.in_error());
    assert_eq!(context.messages()[0].text, "balance -5 is below zero");
}

#[test]
fn error_message_step_takes_the_failure_branch() {
    let mut registry = registry_from_yaml(
        r#"
- service: flagged
  steps:
    - kind: add_message
      name: warn
      message: heads_up
    - kind: add_message
      name: fail
      message: broken
      on_failure: handled
    - kind: set_value
      field: skipped
      value: true
    - kind: set_value
      name: handled
      field: recovered
      value: true
"#,
    );
    registry.add_message(
        "heads_up",
        MessageDefinition {
            severity: MessageSeverity::Warning,
            text: "check the totals".to_string(),
        },
    );
    registry.add_message(
        "broken",
        MessageDefinition {
            severity: MessageSeverity::Error,
            text: "totals do not match".to_string(),
        },
    );
    let runtime = prepare(&registry);
    let mut context = ExecutionContext::new();

    runtime.invoke("flagged", &mut context).expect("invoke flagged");

    assert_eq!(context.value("warnResult"), Some(&Value::Boolean(true)));
    assert!(context.value("skipped").is_none());
    assert_eq!(context.value("recovered"), Some(&Value::Boolean(true)));
    assert_eq!(context.messages().len(), 2);
}

#[test]
fn break_outside_a_loop_is_rejected_at_prepare() {
    let registry = registry_from_yaml(
        r#"
- service: broken
  steps:
    - kind: jump_to
      target: _break
"#,
    );
    let error = Runtime::prepare(&registry, NoopDriver::shared()).expect_err("break outside loop must fail");
    assert!(error.is_configuration());
    assert!(error.to_string().contains("outside of a loop"), "unexpected error: {error}");
}

#[test]
fn unknown_jump_target_is_rejected_at_prepare() {
    let registry = registry_from_yaml(
        r#"
- service: broken
  steps:
    - kind: set_value
      field: x
      value: 1
      on_success: nowhere
"#,
    );
    let error = Runtime::prepare(&registry, NoopDriver::shared()).expect_err("unknown jump must fail");
    assert!(error.to_string().contains("unknown step 'nowhere'"), "unexpected error: {error}");
}

#[test]
fn read_only_service_cannot_host_a_write() {
    let registry = registry_from_yaml(
        r#"
- service: reporting
  access: read_only
  steps:
    - kind: sql
      name: purge
      statement: delete from orders
"#,
    );
    let error = Runtime::prepare(&registry, NoopDriver::shared()).expect_err("lattice violation must fail");
    assert!(error.is_configuration());
    assert!(error.to_string().contains("purge"), "unexpected error: {error}");
}

#[test]
fn sub_service_reuses_the_callers_connection() {
    let registry = registry_from_yaml(
        r#"
- service: outer
  access: read_write
  steps:
    - kind: sql
      statement: insert into audit values (1)
    - kind: sub_service
      name: callInner
      service: inner
- service: inner
  access: read_only
  steps:
    - kind: sql
      operation: query
      sheet: orders
      statement: select * from orders
"#,
    );
    let driver = RecordingDriver::new();
    let runtime = runtime_with(&registry, driver.clone());
    let mut context = ExecutionContext::new();

    runtime.invoke("outer", &mut context).expect("invoke outer");

    assert_eq!(
        driver.events(),
        vec![
            "read_write:open",
            "read_write:execute insert into audit values (1)",
            "read_write:query select * from orders",
            "read_write:commit",
        ]
    );
    assert_eq!(context.value("callInnerResult"), Some(&Value::Boolean(true)));
    assert!(context.sheet("orders").is_some());
}

#[test]
fn failing_statement_rolls_the_invocation_back() {
    let registry = registry_from_yaml(
        r#"
- service: writer
  access: read_write
  steps:
    - kind: sql
      statement: update orders set state = 'done'
    - kind: sql
      statement: update broken set x = 1
"#,
    );
    let driver = RecordingDriver::failing_on("broken");
    let runtime = runtime_with(&registry, driver.clone());
    let mut context = ExecutionContext::new();

    let error = runtime.invoke("writer", &mut context).expect_err("second statement fails");

    assert!(!error.is_configuration());
    assert_eq!(driver.count("read_write:rollback"), 1);
    assert_eq!(driver.count("read_write:commit"), 0);
}
