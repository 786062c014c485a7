/// Implements [`Method`](crate::Method) from an `async fn`-shaped body.
///
/// ```ignore
/// impl Method for Echo {
///     invoke! {
///         async fn invoke(&self, _channel, _request, body: Value) -> Value {
///             Ok(body)
///         }
///     }
/// }
/// ```
#[macro_export]
macro_rules! invoke {
    (async fn invoke(& $self:ident, $channel:ident, $request:ident, $body_ident:ident : $body_ty:ty) -> $output_ty:ty { $($body:tt)* }) => {
        type Body = $body_ty;
        type Output = $output_ty;

        fn invoke<'call>(
            &'call $self,
            $channel: &'call $crate::Channel,
            $request: &'call $crate::Message,
            $body_ident: $body_ty,
        ) -> $crate::BoxFuture<'call, ::std::result::Result<$output_ty, $crate::MethodError>> {
            Box::pin(async move {
                let result: ::std::result::Result<$output_ty, $crate::MethodError> = { $($body)* };
                result
            })
        }
    };
}
