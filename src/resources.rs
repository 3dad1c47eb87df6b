// Named resource helpers
// Each helper only builds a path and parameters; auth, retry and version
// fallback come from the facade primitives underneath.

use reqwest::Method;
use serde_json::{json, Value};

use crate::client::{BrightspaceClient, DownloadedFile};
use crate::error::{BrightspaceError, Result};
use crate::http_client::ApiRequest;
use crate::resolver::ApiFamily;

/// Parameters shared by the bookmark-paged list endpoints
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub page_size: Option<u32>,
    pub bookmark: Option<String>,
}

impl ListParams {
    pub fn page(page_size: u32) -> Self {
        Self {
            page_size: Some(page_size),
            bookmark: None,
        }
    }

    fn apply(&self, req: ApiRequest) -> ApiRequest {
        req.param_opt("pageSize", self.page_size)
            .param_opt("bookmark", self.bookmark.as_deref().filter(|b| !b.is_empty()))
    }
}

fn expect_object(operation: &str, body: Value) -> Result<Value> {
    if body.is_object() {
        Ok(body)
    } else {
        Err(BrightspaceError::Malformed(format!(
            "{} expected a JSON object, got {}",
            operation, body
        )))
    }
}

impl BrightspaceClient {
    async fn lp_body(&self, req: ApiRequest) -> Result<Value> {
        Ok(self.lp(&req).await?.outcome.body)
    }

    async fn le_body(&self, req: ApiRequest) -> Result<Value> {
        Ok(self.le(&req).await?.outcome.body)
    }

    // ---- users / org structure (LP) ----

    pub async fn whoami(&self) -> Result<Value> {
        let body = self.lp_body(ApiRequest::get("/users/whoami")).await?;
        expect_object("whoami", body)
    }

    pub async fn list_users(
        &self,
        list: &ListParams,
        search_term: Option<&str>,
        org_unit_id: Option<u64>,
    ) -> Result<Value> {
        let req = list
            .apply(ApiRequest::get("/users/"))
            .param_opt("searchTerm", search_term.filter(|s| !s.is_empty()))
            .param_opt("orgUnitId", org_unit_id);
        self.lp_body(req).await
    }

    pub async fn get_user(&self, user_id: u64) -> Result<Value> {
        let body = self.lp_body(ApiRequest::get(format!("/users/{}", user_id))).await?;
        expect_object("get_user", body)
    }

    pub async fn list_courses(&self, list: &ListParams) -> Result<Value> {
        let body = self.lp_body(list.apply(ApiRequest::get("/courses/"))).await?;
        expect_object("list_courses", body)
    }

    pub async fn list_org_units(
        &self,
        list: &ListParams,
        org_unit_type_id: Option<u64>,
        search: Option<&str>,
    ) -> Result<Value> {
        let req = list
            .apply(ApiRequest::get("/orgstructure/"))
            .param_opt("orgUnitTypeId", org_unit_type_id)
            .param_opt("search", search.filter(|s| !s.is_empty()));
        self.lp_body(req).await
    }

    pub async fn my_enrollments(&self, list: &ListParams) -> Result<Value> {
        let body = self
            .lp_body(list.apply(ApiRequest::get("/enrollments/myenrollments/")))
            .await?;
        expect_object("my_enrollments", body)
    }

    // ---- news (LE) ----

    pub async fn list_announcements(&self, org_unit_id: u64, list: &ListParams) -> Result<Value> {
        self.le_body(list.apply(ApiRequest::get(format!("/{}/news/", org_unit_id))))
            .await
    }

    pub async fn create_announcement(&self, org_unit_id: u64, title: &str, html: &str) -> Result<Value> {
        let payload = json!({
            "Title": title,
            "IsPublished": true,
            "Body": {"Content": html, "Type": "Html"},
        });
        let body = self
            .le_body(ApiRequest::post(format!("/{}/news/", org_unit_id)).json(payload))
            .await?;
        expect_object("create_announcement", body)
    }

    // ---- content (LE) ----

    pub async fn get_content_toc(&self, org_unit_id: u64) -> Result<Value> {
        self.le_body(ApiRequest::get(format!("/{}/content/toc", org_unit_id)))
            .await
    }

    pub async fn get_content_topic(&self, org_unit_id: u64, topic_id: u64) -> Result<Value> {
        self.le_body(ApiRequest::get(format!(
            "/{}/content/topics/{}",
            org_unit_id, topic_id
        )))
        .await
    }

    /// Topic file, base64-encoded; uses the LE default version
    pub async fn download_content_topic_file(
        &self,
        org_unit_id: u64,
        topic_id: u64,
    ) -> Result<DownloadedFile> {
        let path = self.build_path(
            ApiFamily::Le,
            &format!("/{}/content/topics/{}/file", org_unit_id, topic_id),
            None,
        );
        self.download(&path, &[]).await
    }

    // ---- discussions (LE) ----

    pub async fn list_discussion_forums(&self, org_unit_id: u64) -> Result<Value> {
        self.le_body(ApiRequest::get(format!("/{}/discussions/forums/", org_unit_id)))
            .await
    }

    pub async fn list_discussion_topics(&self, org_unit_id: u64) -> Result<Value> {
        self.le_body(ApiRequest::get(format!("/{}/discussions/topics/", org_unit_id)))
            .await
    }

    pub async fn create_discussion_forum(&self, org_unit_id: u64, body: Value) -> Result<Value> {
        self.le_body(ApiRequest::post(format!("/{}/discussions/forums/", org_unit_id)).json(body))
            .await
    }

    pub async fn create_discussion_topic(&self, org_unit_id: u64, body: Value) -> Result<Value> {
        self.le_body(ApiRequest::post(format!("/{}/discussions/topics/", org_unit_id)).json(body))
            .await
    }

    // ---- quizzes (LE) ----

    pub async fn list_quizzes(&self, org_unit_id: u64, list: &ListParams) -> Result<Value> {
        let req = list.apply(ApiRequest::get(format!("/{}/quizzes/quizzes/", org_unit_id)));
        self.le_body(req).await
    }

    pub async fn get_quiz(&self, org_unit_id: u64, quiz_id: u64) -> Result<Value> {
        self.le_body(ApiRequest::get(format!(
            "/{}/quizzes/quizzes/{}",
            org_unit_id, quiz_id
        )))
        .await
    }

    // ---- grades (LE) ----

    pub async fn list_grade_items(&self, org_unit_id: u64) -> Result<Value> {
        self.le_body(ApiRequest::get(format!("/{}/grades/", org_unit_id)))
            .await
    }

    pub async fn create_grade_item(&self, org_unit_id: u64, body: Value) -> Result<Value> {
        self.le_body(ApiRequest::post(format!("/{}/grades/", org_unit_id)).json(body))
            .await
    }

    pub async fn get_user_grades(&self, org_unit_id: u64, user_id: u64) -> Result<Value> {
        self.le_body(ApiRequest::get(format!(
            "/{}/grades/values/user/{}/",
            org_unit_id, user_id
        )))
        .await
    }

    /// Set a user's grade values; `method` must be PUT or POST
    pub async fn upsert_user_grade_value(
        &self,
        org_unit_id: u64,
        user_id: u64,
        body: Value,
        method: Method,
    ) -> Result<Value> {
        if method != Method::PUT && method != Method::POST {
            return Err(BrightspaceError::InvalidRequest(format!(
                "grade upsert method must be PUT or POST, got {}",
                method
            )));
        }
        let req = ApiRequest::new(
            method,
            format!("/{}/grades/values/user/{}/", org_unit_id, user_id),
        )
        .json(body);
        self.le_body(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_apply() {
        let req = ListParams {
            page_size: Some(25),
            bookmark: Some("b1".to_string()),
        }
        .apply(ApiRequest::get("/courses/"));
        assert_eq!(req.path_and_query(), "/courses/?pageSize=25&bookmark=b1");

        let req = ListParams {
            page_size: None,
            bookmark: Some(String::new()),
        }
        .apply(ApiRequest::get("/courses/"));
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_expect_object() {
        assert!(expect_object("op", json!({"a": 1})).is_ok());
        assert!(matches!(
            expect_object("op", json!([1])),
            Err(BrightspaceError::Malformed(_))
        ));
    }
}
