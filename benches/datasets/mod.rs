use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use ugnos_index::TagSet;

pub const DEFAULT_SEED: u64 = 0x_5547_4E4F_535F_4245; // fixed seed for stable benchmarks

/// `count` distinct `host=host<i>` series, each with `tag_pairs` extra tags `tag<k>=value<v>`
/// drawn from `tag_cardinality` values.
pub fn generate_series_tags(
    seed: u64,
    count: usize,
    tag_pairs: usize,
    tag_cardinality: u32,
) -> Vec<TagSet> {
    assert!(tag_cardinality > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mut tags = TagSet::new();
            tags.insert("host".to_string(), format!("host{}", i));
            for k in 0..tag_pairs {
                let v = rng.random_range(0..tag_cardinality);
                tags.insert(format!("tag{}", k), format!("value{}", v));
            }
            tags
        })
        .collect()
}
