use exobook_result::errors::BoxedErr;
use exobook_search_sync::server::SearchSyncServer;

#[tokio::main]
async fn main() -> Result<(), BoxedErr> {
  let server = SearchSyncServer::new().await;

  match server {
    Ok(srv) => srv.run().await,
    Err(e) => Err(e),
  }
}
