//! Artifact key layout. Every artifact of an evaluation lives under
//! `evaluations/{id}/`.

pub fn evaluation_prefix(evaluation_id: &str) -> String {
    format!("evaluations/{evaluation_id}/")
}

pub fn chunks_prefix(evaluation_id: &str) -> String {
    format!("evaluations/{evaluation_id}/chunks/")
}

pub fn partial_results_prefix(evaluation_id: &str) -> String {
    format!("evaluations/{evaluation_id}/partial_results/")
}

pub fn aggregated_results_prefix(evaluation_id: &str) -> String {
    format!("evaluations/{evaluation_id}/aggregated_results/")
}

pub fn chunk_key(evaluation_id: &str, chunk_index: usize) -> String {
    format!("{}chunk_{chunk_index}.json", chunks_prefix(evaluation_id))
}

pub fn partial_result_key(evaluation_id: &str, chunk_index: usize) -> String {
    format!("{}chunk_{chunk_index}.json", partial_results_prefix(evaluation_id))
}

pub fn detailed_results_key(evaluation_id: &str) -> String {
    format!("{}detailed_results.json", aggregated_results_prefix(evaluation_id))
}

/// Prefixes removed by cleanup, in deletion order.
pub fn intermediate_prefixes(evaluation_id: &str) -> [String; 3] {
    [
        chunks_prefix(evaluation_id),
        partial_results_prefix(evaluation_id),
        aggregated_results_prefix(evaluation_id),
    ]
}

/// Chunk index from a `.../chunk_{n}.json` key.
pub fn parse_chunk_index(key: &str) -> Option<usize> {
    let file = key.rsplit('/').next()?;
    file.strip_prefix("chunk_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
