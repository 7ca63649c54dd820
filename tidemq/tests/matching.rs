use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tidemq::codec::QoS;
use tidemq::router::Router;
use tidemq::topic::Topic;
use tidemq::types::{ClientId, TopicName};

const LEVELS: [&str; 4] = ["a", "b", "", "c"];

fn random_topic(rng: &mut StdRng) -> String {
    let n = rng.random_range(1..5);
    let topic = (0..n).map(|_| LEVELS[rng.random_range(0..LEVELS.len())]).collect::<Vec<_>>().join("/");
    if topic.is_empty() {
        "a".into()
    } else {
        topic
    }
}

fn random_filter(rng: &mut StdRng) -> String {
    let n = rng.random_range(1..5);
    let mut levels = Vec::with_capacity(n);
    for i in 0..n {
        let level = match rng.random_range(0..10) {
            0 | 1 => "+",
            2 if i == n - 1 => "#",
            _ => LEVELS[rng.random_range(0..LEVELS.len())],
        };
        levels.push(level);
    }
    let filter = levels.join("/");
    if filter.is_empty() {
        "+".into()
    } else {
        filter
    }
}

#[test]
fn router_agrees_with_filter_semantics() {
    let mut rng = StdRng::seed_from_u64(0x7d3e);
    for round in 0..50 {
        let router = Router::new();
        let filters = (0..20).map(|_| random_filter(&mut rng)).collect::<Vec<_>>();
        for (i, f) in filters.iter().enumerate() {
            router.add(f, ClientId::from(format!("c{}", i)), QoS::AtMostOnce).unwrap();
        }

        for _ in 0..20 {
            let topic = random_topic(&mut rng);
            let mut expected = filters
                .iter()
                .enumerate()
                .filter(|(_, f)| Topic::filter(f.as_str()).unwrap().matches_str(&topic))
                .map(|(i, _)| format!("c{}", i))
                .collect::<Vec<_>>();
            expected.sort();

            let mut got = router
                .matches(&TopicName::from(topic.clone()))
                .unwrap()
                .into_iter()
                .map(|(c, _)| c.to_string())
                .collect::<Vec<_>>();
            got.sort();
            assert_eq!(got, expected, "round {}, topic {:?}, filters {:?}", round, topic, filters);
        }
    }
}

#[test]
fn empty_segment_edge_case() {
    let router = Router::new();
    router.add("a//b", ClientId::from("exact"), QoS::AtMostOnce).unwrap();
    router.add("a/+/b", ClientId::from("plus"), QoS::AtMostOnce).unwrap();
    let hit = |t: &str| {
        let mut v = router.matches(&TopicName::from(t)).unwrap().into_iter().map(|(c, _)| c.to_string()).collect::<Vec<_>>();
        v.sort();
        v
    };
    assert_eq!(hit("a//b"), vec!["exact".to_string(), "plus".to_string()]);
    assert_eq!(hit("a/b"), Vec::<String>::new());
    assert_eq!(hit("a/x/b"), vec!["plus".to_string()]);
}
