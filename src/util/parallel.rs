/// パーティション単位のファンアウト。
use std::collections::BTreeMap;

use rayon::prelude::*;

/// `f` を各パーティションに適用し、キー順の結果を返す。
///
/// `parallelism` が 1 以下なら逐次実行、それ以外は専用の rayon プールで実行する。
/// スレッド数は CPU 数を上限とする。
pub fn map_partitions<T, R, F>(parallelism: usize, items: &BTreeMap<String, T>, f: F) -> Vec<(String, R)>
where
    T: Sync,
    R: Send,
    F: Fn(&str, &T) -> R + Sync + Send,
{
    let threads = parallelism.min(num_cpus::get()).max(1);
    if threads == 1 || items.len() < 2 {
        return items
            .iter()
            .map(|(key, value)| (key.clone(), f(key, value)))
            .collect();
    }

    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(|| {
            items
                .par_iter()
                .map(|(key, value)| (key.clone(), f(key, value)))
                .collect()
        }),
        Err(error) => {
            tracing::warn!(error = %error, threads, "thread pool unavailable, running sequentially");
            items
                .iter()
                .map(|(key, value)| (key.clone(), f(key, value)))
                .collect()
        }
    }
}
