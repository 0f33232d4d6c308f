use std::sync::Arc;

use hivesim_core::{
    EvalError, Model, ModelDescriptor, Point, Registry, SimulationConfig, Simulation, Value,
    ValueType,
};

fn build(json: &str) -> Simulation {
    let registry = Arc::new(Registry::with_builtins());
    let descriptor: ModelDescriptor = serde_json::from_str(json).expect("descriptor");
    let model = Arc::new(Model::compile(&descriptor, &registry).expect("model compiles"));
    Simulation::new(model, registry, SimulationConfig::default()).expect("simulation")
}

const ANTS: &str = r#"{
    "name": "colony",
    "environment": {"width": 60.0, "height": 40.0},
    "global": {
        "init": [{"create": {"species": "ant", "count": {"lit": 20}}}]
    },
    "species": [{
        "name": "ant",
        "skills": ["moving"],
        "reflexes": [{"name": "roam", "body": [{"do": {"action": "wander"}}]}]
    }]
}"#;

const SAVANNA: &str = r#"{
    "name": "savanna",
    "environment": {"width": 50.0, "height": 50.0},
    "global": {
        "init": [
            {"create": {"species": "hunter", "with": [
                {"var": "location", "value": {"call": {"op": "point", "args": [{"lit": 10.0}, {"lit": 10.0}]}}}
            ]}},
            {"create": {"species": "prey", "count": {"lit": 2}, "with": [
                {"var": "location", "value": {"call": {"op": "point", "args": [{"lit": 11.0}, {"lit": 10.0}]}}}
            ]}},
            {"create": {"species": "prey", "with": [
                {"var": "location", "value": {"call": {"op": "point", "args": [{"lit": 40.0}, {"lit": 40.0}]}}}
            ]}}
        ]
    },
    "species": [
        {
            "name": "hunter",
            "variables": [{"name": "seen", "type": "int", "init": {"lit": -1}}],
            "reflexes": [
                {"name": "hunt", "body": [{"ask": {
                    "target": {"call": {"op": "agents_at_distance", "args": [{"lit": 3.0}]}},
                    "species": "prey",
                    "body": ["die"]
                }}]},
                {"name": "look", "body": [{"set": {
                    "var": "seen",
                    "value": {"call": {"op": "length", "args": [
                        {"call": {"op": "agents_at_distance", "args": [{"lit": 3.0}]}}
                    ]}}
                }}]}
            ]
        },
        {"name": "prey"}
    ]
}"#;

#[test]
fn wandering_ants_stay_inside_a_bounded_environment() {
    let mut sim = build(ANTS);
    sim.setup("explore", 7).expect("setup");
    assert_eq!(sim.population_agents("ant").len(), 20);
    for _ in 0..10 {
        sim.step().expect("step");
    }
    assert_eq!(sim.cycle(), 10);
    assert_eq!(sim.world_variable("cycle"), Ok(Value::Int(10)));
    for ant in sim.population_agents("ant") {
        let location = sim.location(ant).expect("location");
        assert!(sim.environment().contains(location), "{location:?} escaped");
    }
    assert_eq!(sim.open_scopes(), 0);
}

#[test]
fn same_seed_replays_the_same_trajectory() {
    let trajectory = |seed: u64| {
        let mut sim = build(ANTS);
        sim.setup("explore", seed).expect("setup");
        for _ in 0..5 {
            sim.step().expect("step");
        }
        sim.population_agents("ant")
            .into_iter()
            .map(|ant| sim.location(ant).expect("location"))
            .collect::<Vec<Point>>()
    };
    assert_eq!(trajectory(11), trajectory(11));
    assert_ne!(trajectory(11), trajectory(12));
}

#[test]
fn killed_agents_vanish_from_same_step_neighbor_queries() {
    let mut sim = build(SAVANNA);
    sim.setup("hunt", 1).expect("setup");
    let hunter = sim.population_agents("hunter")[0];
    let prey = sim.population_agents("prey");
    assert_eq!(prey.len(), 3);

    sim.step().expect("step");

    assert_eq!(sim.variable(hunter, "seen"), Ok(Value::Int(0)));
    let survivors = sim.population_agents("prey");
    assert_eq!(survivors, vec![prey[2]]);
    assert!(matches!(
        sim.variable(prey[0], "name"),
        Err(EvalError::AgentUnavailable(_))
    ));
    let population = sim.population_named("prey").expect("prey population");
    assert_eq!(sim.population(population).map(|p| p.len()), Some(1));
}

const LATTICE: &str = r#"{
    "name": "lattice",
    "environment": {"width": 40.0, "height": 40.0, "torus": true},
    "global": {
        "init": [
            {"create": {"species": "post", "with": [
                {"var": "location", "value": {"call": {"op": "point", "args": [{"lit": 1.0}, {"lit": 1.0}]}}}
            ]}},
            {"create": {"species": "post", "with": [
                {"var": "location", "value": {"call": {"op": "point", "args": [{"lit": 39.0}, {"lit": 39.0}]}}}
            ]}},
            {"create": {"species": "post", "with": [
                {"var": "location", "value": {"call": {"op": "point", "args": [{"lit": 20.0}, {"lit": 20.0}]}}}
            ]}}
        ]
    },
    "species": [{"name": "post"}]
}"#;

#[test]
fn neighbor_queries_past_the_environment_extent_return_everyone_once() {
    let mut sim = build(LATTICE);
    sim.setup("survey", 2).expect("setup");
    let posts = sim.population_agents("post");
    assert_eq!(posts.len(), 3);
    for radius in [f64::INFINITY, 1e12, 40.0] {
        let mut found = sim.neighbors(posts[0], radius).expect("neighbors");
        found.sort();
        let mut expected = vec![posts[1], posts[2]];
        expected.sort();
        assert_eq!(found, expected, "radius {radius}");
    }
}

#[test]
fn torus_neighbor_queries_wrap_across_the_corner() {
    let mut sim = build(LATTICE);
    sim.setup("survey", 2).expect("setup");
    let posts = sim.population_agents("post");
    assert_eq!(sim.neighbors(posts[0], 3.0), Ok(vec![posts[1]]));
    assert_eq!(sim.neighbors(posts[2], 3.0), Ok(Vec::new()));
}

#[test]
fn recycled_slots_reuse_the_lowest_free_index() {
    let mut sim = build(SAVANNA);
    sim.setup("hunt", 1).expect("setup");
    sim.step().expect("step");
    let population = sim.population_named("prey").expect("prey population");
    let created = sim
        .with_world_scope("spawn", |sim, scope| {
            sim.create_agents(scope, population, 1, &[], false)
        })
        .expect("create");
    assert_eq!(sim.agent(created[0]).expect("agent").index(), 0);
}

#[test]
fn runtime_errors_carry_the_scope_context() {
    let mut sim = build(
        r#"{
            "name": "broken",
            "global": {
                "variables": [{"name": "ratio", "type": "float", "init": {"lit": 1.0}}],
                "reflexes": [{"name": "divide", "body": [{"set": {
                    "var": "ratio",
                    "value": {"call": {"op": "/", "args": [{"lit": 1.0}, {"lit": 0.0}]}}
                }}]}]
            }
        }"#,
    );
    sim.setup("fail", 0).expect("setup");
    let err = sim.step().expect_err("division by zero");
    assert_eq!(err.error, EvalError::DivisionByZero);
    assert_eq!(err.context.purpose, "step");
    assert_eq!(err.context.agents, vec!["broken".to_string()]);
    assert_eq!(sim.cycle(), 0);
    assert_eq!(sim.open_scopes(), 0);
}

#[test]
fn socialize_links_the_caller_to_each_peer_once() {
    let mut sim = build(
        r#"{
            "name": "club",
            "environment": {"width": 20.0, "height": 20.0},
            "global": {"init": [{"create": {"species": "person", "count": {"lit": 3}}}]},
            "species": [{
                "name": "person",
                "skills": ["social"],
                "reflexes": [{"name": "meet", "body": [{"ask": {
                    "target": {"call": {"op": "agents_at_distance", "args": [{"lit": 100.0}]}},
                    "species": "person",
                    "body": [{"socialize": {"appreciation": {"lit": 0.5}}}]
                }}]}]
            }]
        }"#,
    );
    sim.setup("meet", 5).expect("setup");
    sim.step().expect("first step");
    sim.step().expect("second step");
    let people = sim.population_agents("person");
    for person in &people {
        let links = sim.variable(*person, "social_links").expect("links");
        let links = links.as_list().expect("list of links");
        assert_eq!(links.len(), 2);
        for link in links {
            let Value::Map(entries) = link else {
                panic!("link is not a map: {link:?}");
            };
            assert_eq!(entries.get("appreciation"), Some(&Value::Float(0.5)));
            assert_eq!(entries.get("dominance"), Some(&Value::Float(0.0)));
            let peer = entries.get("agent").and_then(Value::as_agent).expect("peer");
            assert_ne!(peer, *person);
        }
    }
    assert_eq!(sim.open_scopes(), 0);
}

#[test]
fn socialize_stores_every_facet_as_a_float() {
    let mut sim = build(
        r#"{
            "name": "club",
            "environment": {"width": 20.0, "height": 20.0},
            "global": {"init": [{"create": {"species": "person", "count": {"lit": 2}}}]},
            "species": [{
                "name": "person",
                "skills": ["social"],
                "reflexes": [{"name": "meet", "body": [{"ask": {
                    "target": {"call": {"op": "agents_at_distance", "args": [{"lit": 100.0}]}},
                    "species": "person",
                    "body": [{"socialize": {
                        "appreciation": {"lit": 1},
                        "dominance": {"lit": true},
                        "solidarity": {"lit": "2.5"}
                    }}]
                }}]}]
            }]
        }"#,
    );
    sim.setup("meet", 5).expect("setup");
    sim.step().expect("step");
    for person in sim.population_agents("person") {
        let links = sim.variable(person, "social_links").expect("links");
        let Some([Value::Map(entries)]) = links.as_list() else {
            panic!("expected one link: {links:?}");
        };
        assert_eq!(entries.get("appreciation"), Some(&Value::Float(1.0)));
        assert_eq!(entries.get("dominance"), Some(&Value::Float(1.0)));
        assert_eq!(entries.get("solidarity"), Some(&Value::Float(2.5)));
        assert_eq!(entries.get("familiarity"), Some(&Value::Float(0.0)));
    }
}

#[test]
fn socialize_rejects_a_facet_without_a_numeric_reading() {
    let mut sim = build(
        r#"{
            "name": "club",
            "environment": {"width": 20.0, "height": 20.0},
            "global": {"init": [{"create": {"species": "person", "count": {"lit": 2}}}]},
            "species": [{
                "name": "person",
                "skills": ["social"],
                "reflexes": [{"name": "meet", "body": [{"ask": {
                    "target": {"call": {"op": "agents_at_distance", "args": [{"lit": 100.0}]}},
                    "species": "person",
                    "body": [{"socialize": {
                        "familiarity": {"call": {"op": "point", "args": [{"lit": 1.0}, {"lit": 2.0}]}}
                    }}]
                }}]}]
            }]
        }"#,
    );
    sim.setup("meet", 5).expect("setup");
    let err = sim.step().expect_err("point facet");
    assert!(matches!(
        err.error,
        EvalError::TypeMismatch { expected: ValueType::Float, .. }
    ));
    assert_eq!(sim.open_scopes(), 0);
}

#[test]
fn disposing_twice_is_harmless_and_blocks_stepping() {
    let mut sim = build(ANTS);
    sim.setup("explore", 3).expect("setup");
    sim.step().expect("step");
    sim.dispose();
    sim.dispose();
    assert!(sim.is_disposed());
    assert_eq!(sim.agent_count(), 0);
    assert_eq!(sim.step().map_err(|err| err.error), Err(EvalError::SimulationDisposed));
}
