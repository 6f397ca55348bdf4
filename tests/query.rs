mod common;

use approx::assert_relative_eq;
use common::{fake_score, three_models, Fixture, COLOR, SHAPE, SIZE, WEIGHT};
use loombridge_core::engine::EngineValue;
use loombridge_core::{ColNo, Error, HostConnection, ModelNo, RowId, Value};

#[test]
fn test_dependence_probability() {
    let fixture = Fixture::trained(three_models());
    let dependence = |a: ColNo, b: ColNo| {
        fixture
            .bridge
            .column_dependence_probability(&fixture.host, fixture.generator, None, a, b)
            .unwrap()
    };

    assert_relative_eq!(dependence(COLOR, SIZE), 2.0 / 3.0);
    assert_relative_eq!(dependence(SIZE, COLOR), 2.0 / 3.0);
    assert_eq!(dependence(SHAPE, WEIGHT), 1.0);
    assert_eq!(dependence(COLOR, WEIGHT), 0.0);
    assert_eq!(dependence(COLOR, COLOR), 1.0);

    let subset = fixture
        .bridge
        .column_dependence_probability(
            &fixture.host,
            fixture.generator,
            Some(&[ModelNo(0), ModelNo(1)]),
            COLOR,
            SIZE,
        )
        .unwrap();
    assert_eq!(subset, 1.0);
}

#[test]
fn test_dependence_unknown_column() {
    let fixture = Fixture::trained(three_models());
    let err = fixture
        .bridge
        .column_dependence_probability(&fixture.host, fixture.generator, None, COLOR, ColNo(9))
        .unwrap_err();
    assert!(err.is_schema_error());
}

#[test]
fn test_queries_need_models() {
    let fixture = Fixture::new();
    let err = fixture
        .bridge
        .column_dependence_probability(&fixture.host, fixture.generator, None, COLOR, SIZE)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_predictive_relevance() {
    let fixture = Fixture::trained(three_models());
    let relevance = fixture
        .bridge
        .predictive_relevance(
            &fixture.host,
            fixture.generator,
            None,
            RowId(1),
            &[RowId(2), RowId(3), RowId(4), RowId(1)],
            COLOR,
        )
        .unwrap();
    assert_eq!(relevance.len(), 4);
    assert_relative_eq!(relevance[0], 2.0 / 3.0);
    assert_relative_eq!(relevance[1], 2.0 / 3.0);
    assert_eq!(relevance[2], 0.0);
    assert_eq!(relevance[3], 1.0);

    let err = fixture
        .bridge
        .predictive_relevance(&fixture.host, fixture.generator, None, RowId(1), &[RowId(9)], COLOR)
        .unwrap_err();
    assert!(matches!(err, Error::MissingPartition { .. }));
}

#[test]
fn test_simulate_adds_row_values_as_constraints() {
    let fixture = Fixture::trained(three_models());
    fixture.servers.predict_values("size", &["1.5", "2.5", "3.5"]);

    let draws = fixture
        .bridge
        .simulate_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(1),
            &[SIZE],
            &[(COLOR, Value::from("red"))],
            3,
        )
        .unwrap();
    assert_eq!(
        draws,
        vec![vec![Value::Real(1.5)], vec![Value::Real(2.5)], vec![Value::Real(3.5)]]
    );

    let requests = fixture.servers.log.requests.lock();
    let (request, count) = &requests[0];
    assert_eq!(*count, 3);
    assert_eq!(request.header, vec!["size", "color", "shape", "weight"]);
    assert_eq!(request.values, vec!["", "red", "round", "10"]);
}

#[test]
fn test_simulate_conflicting_constraint() {
    let fixture = Fixture::trained(three_models());
    let err = fixture
        .bridge
        .simulate_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(1),
            &[SIZE],
            &[(COLOR, Value::from("blue"))],
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintConflict { colno } if colno == COLOR));

    let err = fixture
        .bridge
        .simulate_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(5),
            &[SIZE],
            &[(SIZE, Value::Real(1.0))],
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintConflict { colno } if colno == SIZE));
    assert!(fixture.servers.log.requests.lock().is_empty());
}

#[test]
fn test_simulate_hypothetical_row() {
    let fixture = Fixture::trained(three_models());
    fixture.servers.predict_values("color", &["blue"]);
    fixture.servers.predict_values("weight", &["12.5"]);

    let draws = fixture
        .bridge
        .simulate_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(5),
            &[COLOR, WEIGHT],
            &[(SIZE, Value::Real(2.0))],
            2,
        )
        .unwrap();
    assert_eq!(draws.len(), 2);
    assert_eq!(draws[1], vec![Value::from("blue"), Value::Real(12.5)]);

    let requests = fixture.servers.log.requests.lock();
    assert_eq!(requests[0].0.header, vec!["color", "weight", "size"]);
    assert_eq!(requests[0].0.values, vec!["", "", "2"]);
}

#[test]
fn test_simulate_rejects_zero_samples() {
    let fixture = Fixture::trained(three_models());
    let err = fixture
        .bridge
        .simulate_joint(&fixture.host, fixture.generator, None, RowId(1), &[SIZE], &[], 0)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_predict_confidence() {
    let fixture = Fixture::trained(three_models());
    fixture.servers.predict_values("color", &["red", "red"]);
    fixture.servers.predict_values("size", &["1.0", "3.0"]);

    let (value, confidence) = fixture
        .bridge
        .predict_confidence(&fixture.host, fixture.generator, None, RowId(4), COLOR, None)
        .unwrap();
    assert_eq!(value, Value::from("red"));
    assert_eq!(confidence, 1.0);

    let (value, confidence) = fixture
        .bridge
        .predict_confidence(&fixture.host, fixture.generator, None, RowId(3), SIZE, None)
        .unwrap();
    assert_eq!(value, Value::Real(2.0));
    assert_eq!(confidence, 0.0);

    let requests = fixture.servers.log.requests.lock();
    assert!(requests.iter().all(|(_, count)| *count == 2));
    // The stored target cell never constrains its own prediction.
    assert_eq!(requests[0].0.header[0], "color");
    assert!(!requests[0].0.header[1..].contains(&"color".to_string()));
}

#[test]
fn test_predict_confidence_mixed_draws() {
    let fixture = Fixture::trained(three_models());
    fixture.servers.predict_values("shape", &["square", "round", "square", "square"]);

    let (value, confidence) = fixture
        .bridge
        .predict_confidence(&fixture.host, fixture.generator, None, RowId(4), SHAPE, Some(4))
        .unwrap();
    assert_eq!(value, Value::from("square"));
    assert_relative_eq!(confidence, 0.75);

    let err = fixture
        .bridge
        .predict_confidence(&fixture.host, fixture.generator, None, RowId(4), SHAPE, Some(0))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_logpdf_is_score_difference() {
    let fixture = Fixture::trained(three_models());
    let logpdf = fixture
        .bridge
        .logpdf_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(5),
            &[(WEIGHT, Value::Real(5.0))],
            &[(COLOR, Value::from("red"))],
        )
        .unwrap();

    // Ranks: weight, shape, size, color.
    let and_case = vec![Some(EngineValue::Real(5.0)), None, None, Some(EngineValue::Code(2))];
    let conditional_case = vec![None, None, None, Some(EngineValue::Code(2))];
    assert_eq!(
        *fixture.servers.log.scores.lock(),
        vec![and_case.clone(), conditional_case.clone()]
    );
    assert_relative_eq!(logpdf, fake_score(&and_case) - fake_score(&conditional_case));
}

#[test]
fn test_logpdf_unknown_category() {
    let fixture = Fixture::trained(three_models());
    let err = fixture
        .bridge
        .logpdf_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(5),
            &[(COLOR, Value::from("purple"))],
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, Error::MissingEncoding { .. }));
    assert!(fixture.servers.log.scores.lock().is_empty());
}

#[test]
fn test_row_similarity_sends_rank_ordered_rows() {
    let fixture = Fixture::trained(three_models());
    let similarity = fixture
        .bridge
        .row_similarity(&fixture.host, fixture.generator, None, RowId(1), RowId(3), &[COLOR])
        .unwrap();
    assert_eq!(similarity, 0.75);

    let calls = fixture.servers.log.similar.lock();
    let some = |s: &str| Some(s.to_string());
    assert_eq!(calls[0].0, vec![some("10"), some("round"), some("1"), some("red")]);
    assert_eq!(calls[0].1, vec![some("30"), some("round"), None, some("red")]);
}

#[test]
fn test_mutual_information_defaults_sample_count() {
    let fixture = Fixture::trained(three_models());
    let mi = fixture
        .bridge
        .column_mutual_information(&fixture.host, fixture.generator, None, &[COLOR], &[SIZE, WEIGHT], None)
        .unwrap();
    assert_eq!(mi, 0.25);
    fixture
        .bridge
        .column_mutual_information(&fixture.host, fixture.generator, None, &[COLOR], &[SIZE], Some(50))
        .unwrap();

    let calls = fixture.servers.log.mutual_information.lock();
    assert_eq!(
        calls[0],
        (vec!["color".to_string()], vec!["size".to_string(), "weight".to_string()], 1000)
    );
    assert_eq!(calls[1].2, 50);
    assert_eq!(fixture.servers.opened_query(), 1);
    assert_eq!(fixture.servers.opened_predict(), 0);
}

#[test]
fn test_servers_unavailable() {
    let fixture = Fixture::trained(three_models());
    let bridge = fixture.bridge_without_servers();
    let err = bridge
        .logpdf_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(5),
            &[(SIZE, Value::Real(1.0))],
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, Error::ServersUnavailable));

    // Partition-only queries still work.
    let p = bridge
        .column_dependence_probability(&fixture.host, fixture.generator, None, SHAPE, WEIGHT)
        .unwrap();
    assert_eq!(p, 1.0);
}

#[test]
fn test_connections_do_not_share_servers() {
    let fixture = Fixture::trained(three_models());
    let other = fixture.host.try_clone().unwrap();
    let score = |host: &HostConnection| {
        fixture
            .bridge
            .logpdf_joint(
                host,
                fixture.generator,
                None,
                RowId(5),
                &[(SIZE, Value::Real(1.0))],
                &[],
            )
            .unwrap()
    };

    score(&fixture.host);
    score(&fixture.host);
    assert_eq!(fixture.servers.opened_query(), 1);
    score(&other);
    assert_eq!(fixture.servers.opened_query(), 2);
    assert_eq!(fixture.bridge.cache().len(), 2);

    fixture.bridge.disconnect(&fixture.host);
    assert_eq!(fixture.bridge.cache().len(), 1);
    score(&other);
    assert_eq!(fixture.servers.opened_query(), 2);
}

#[test]
fn test_failed_server_call_evicts_handle() {
    let fixture = Fixture::trained(three_models());
    let score = || {
        fixture.bridge.logpdf_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(5),
            &[(SIZE, Value::Real(1.0))],
            &[],
        )
    };

    score().unwrap();
    assert_eq!(fixture.servers.opened_query(), 1);

    fixture.servers.fail_scores(true);
    let err = score().unwrap_err();
    assert!(matches!(err, Error::Engine { generator, .. } if generator == fixture.generator));
    assert!(fixture.bridge.cache().is_empty());

    fixture.servers.fail_scores(false);
    score().unwrap();
    assert_eq!(fixture.servers.opened_query(), 2);
}

#[test]
fn test_logpdf_rejects_corrupt_ordering() {
    let fixture = Fixture::trained(three_models());
    let logpdf = |colno: ColNo| {
        fixture.bridge.logpdf_joint(
            &fixture.host,
            fixture.generator,
            None,
            RowId(5),
            &[(colno, Value::Real(1.0))],
            &[],
        )
    };

    fixture
        .host
        .execute_batch("UPDATE loom_column_ordering SET col_rank = -1 WHERE colno = 1")
        .unwrap();
    assert!(matches!(logpdf(SIZE), Err(Error::InvalidPartition(_))));

    fixture
        .host
        .execute_batch("UPDATE loom_column_ordering SET col_rank = 9 WHERE colno = 3")
        .unwrap();
    assert!(matches!(logpdf(WEIGHT), Err(Error::InvalidPartition(_))));
    assert!(fixture.servers.log.scores.lock().is_empty());
}
