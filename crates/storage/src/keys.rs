//! Object key layout.

use foundry_core::types::DbId;

/// `segments/{project_id}/{segment_id}/{fingerprint}.mp4`
pub fn segment_key(project_id: DbId, segment_id: DbId, fingerprint: &str) -> String {
    format!("segments/{project_id}/{segment_id}/{fingerprint}.mp4")
}

/// `renders/{project_id}/{job_id}.mp4`
pub fn render_key(project_id: DbId, job_id: DbId) -> String {
    format!("renders/{project_id}/{job_id}.mp4")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(segment_key(3, 17, "ab12"), "segments/3/17/ab12.mp4");
        assert_eq!(render_key(3, 5), "renders/3/5.mp4");
    }
}
