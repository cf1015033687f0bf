//! 層化分割
//!
//! クラスごとの比率を保ったままマニフェストを2つに分けます。
//! 同じシードと同じ入力順からは常に同じ分割が得られます。

use std::collections::BTreeMap;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::{Manifest, Sample};
use crate::error::{ClassifierError, Result};

/// `fraction` の割合を1つ目、残りを2つ目のマニフェストに振り分ける
///
/// 各クラスの1つ目への割当数は `fraction * n` の切り捨てか切り上げのどちらかになります。
pub fn stratified_split(manifest: &Manifest, fraction: f64, seed: u64) -> Result<(Manifest, Manifest)> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(ClassifierError::InvalidFraction(fraction));
    }
    if manifest.is_empty() {
        return Err(ClassifierError::EmptyManifest(PathBuf::new()));
    }

    let mut groups: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in manifest.samples() {
        groups.entry(sample.label()).or_default().push(sample);
    }
    for (label, members) in &groups {
        if members.len() < 2 {
            return Err(ClassifierError::InsufficientSamples {
                label: label.to_string(),
                count: members.len(),
            });
        }
    }

    let total = manifest.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let sizes: Vec<usize> = groups.values().map(Vec::len).collect();
    let quotas = allocate(&sizes, fraction, &mut rng);
    let first_total: usize = quotas.iter().sum();

    let mut first = Vec::with_capacity(first_total);
    let mut second = Vec::with_capacity(total - first_total);
    for ((_, members), quota) in groups.into_iter().zip(quotas) {
        let mut members = members;
        members.shuffle(&mut rng);
        let (head, tail) = members.split_at(quota);
        first.extend(head.iter().map(|s| (*s).clone()));
        second.extend(tail.iter().map(|s| (*s).clone()));
    }
    first.shuffle(&mut rng);
    second.shuffle(&mut rng);

    log::info!(
        "層化分割 (fraction={}, seed={}): {} 枚 -> {} / {}",
        fraction,
        seed,
        total,
        first.len(),
        second.len()
    );

    Ok((Manifest::from_samples(first), Manifest::from_samples(second)))
}

/// クラスごとの割当数
///
/// `fraction * n_i` の切り捨てから始め、全体が `round(fraction * n)` になるまで
/// 端数の大きいクラスから1つずつ切り上げる（同順位はシャッフルで決める）。
/// 全体は 1 以上 n - 1 以下に収める。
fn allocate(sizes: &[usize], fraction: f64, rng: &mut StdRng) -> Vec<usize> {
    let exact: Vec<f64> = sizes.iter().map(|&n| fraction * n as f64).collect();
    let mut quotas: Vec<usize> = exact.iter().map(|q| q.floor() as usize).collect();
    let remainder = |class: usize| exact[class] - exact[class].floor();

    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.shuffle(rng);
    order.sort_by(|&a, &b| remainder(b).total_cmp(&remainder(a)));

    let total: usize = sizes.iter().sum();
    let target = ((fraction * total as f64).round() as usize).clamp(1, total - 1);
    let floored: usize = quotas.iter().sum();

    for &class in order.iter().take(target.saturating_sub(floored)) {
        if remainder(class) > 0.0 {
            quotas[class] += 1;
        }
    }

    quotas
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn manifest(per_class: &[(&str, usize)]) -> Manifest {
        per_class
            .iter()
            .flat_map(|(label, count)| {
                (0..*count).map(move |i| Sample::new(format!("/data/{label}/{i}.jpg"), *label))
            })
            .collect()
    }

    fn multiset(m: &Manifest) -> HashMap<Sample, usize> {
        let mut counts = HashMap::new();
        for s in m.samples() {
            *counts.entry(s.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_split_preserves_every_sample() {
        let input = manifest(&[("glioma", 7), ("meningioma", 5), ("notumor", 9), ("pituitary", 4)]);
        let (a, b) = stratified_split(&input, 0.5, 20).unwrap();

        let mut joined: Vec<Sample> = a.samples().to_vec();
        joined.extend_from_slice(b.samples());
        assert_eq!(multiset(&Manifest::from_samples(joined)), multiset(&input));
        assert_eq!(a.len() + b.len(), input.len());
    }

    #[test]
    fn test_split_keeps_class_proportions() {
        let input = manifest(&[("glioma", 30), ("meningioma", 31), ("notumor", 41), ("pituitary", 30)]);
        let fraction = 0.3;
        let (a, b) = stratified_split(&input, fraction, 7).unwrap();

        let (ca, cb) = (a.class_counts(), b.class_counts());
        for (label, n) in input.class_counts() {
            let expected = fraction * n as f64;
            assert!((ca[&label] as f64 - expected).abs() <= 1.0, "{label}: {}", ca[&label]);
            assert!((cb[&label] as f64 - (n as f64 - expected)).abs() <= 1.0);
        }
    }

    #[test]
    fn test_twelve_samples_half_split() {
        let input = manifest(&[("glioma", 3), ("meningioma", 3), ("notumor", 3), ("pituitary", 3)]);
        let (a, b) = stratified_split(&input, 0.5, 20).unwrap();

        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 6);
        for counts in [a.class_counts(), b.class_counts()] {
            assert_eq!(counts.len(), 4);
            assert!(counts.values().all(|&c| (1..=2).contains(&c)));
        }
    }

    #[test]
    fn test_split_is_deterministic_for_seed() {
        let input = manifest(&[("glioma", 6), ("pituitary", 6)]);
        let first = stratified_split(&input, 0.5, 20).unwrap();
        let second = stratified_split(&input, 0.5, 20).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_sample_class_is_rejected() {
        let input = manifest(&[("glioma", 4), ("notumor", 1)]);
        let err = stratified_split(&input, 0.5, 20).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::InsufficientSamples { ref label, count: 1 } if label == "notumor"
        ));
    }

    #[test]
    fn test_fraction_out_of_range() {
        let input = manifest(&[("glioma", 4)]);
        assert!(matches!(
            stratified_split(&input, 1.0, 0),
            Err(ClassifierError::InvalidFraction(_))
        ));
        assert!(matches!(
            stratified_split(&input, 0.0, 0),
            Err(ClassifierError::InvalidFraction(_))
        ));
    }

    #[test]
    fn test_every_class_within_one_sample_of_fraction() {
        let shapes: [&[usize]; 5] = [&[3, 3, 7], &[2, 2, 2, 2], &[2, 9], &[5, 11, 4, 13], &[17, 2, 3]];
        for sizes in shapes {
            let labels = ["glioma", "meningioma", "notumor", "pituitary"];
            let per_class: Vec<(&str, usize)> = labels.iter().copied().zip(sizes.iter().copied()).collect();
            let input = manifest(&per_class);

            for fraction in [0.1, 0.3, 0.5, 0.66, 0.9] {
                for seed in [0, 20] {
                    let (a, b) = stratified_split(&input, fraction, seed).unwrap();
                    assert!(!a.is_empty() && !b.is_empty());
                    assert_eq!(a.len() + b.len(), input.len());

                    let (ca, cb) = (a.class_counts(), b.class_counts());
                    for (label, n) in input.class_counts() {
                        let expected = fraction * n as f64;
                        let first = ca.get(&label).copied().unwrap_or(0);
                        let second = cb.get(&label).copied().unwrap_or(0);
                        assert!(
                            (first as f64 - expected).abs() < 1.0,
                            "{label}: n={n} first={first} fraction={fraction}"
                        );
                        assert_eq!(first + second, n);
                    }
                }
            }
        }
    }

    #[test]
    fn test_empty_manifest_is_rejected() {
        assert!(matches!(
            stratified_split(&Manifest::default(), 0.5, 20),
            Err(ClassifierError::EmptyManifest(_))
        ));
        assert!(matches!(
            stratified_split(&Manifest::from_samples(vec![]), 0.3, 0),
            Err(ClassifierError::EmptyManifest(_))
        ));
    }
}
