use courier::templates::{
    BookingCancellationVars, EmailTemplate, Renderer, TemplateError, TemplateId,
};
use serde_json::json;

#[test]
fn otp_request_from_json_renders_everywhere() {
    let template: EmailTemplate = serde_json::from_value(json!({
        "template": "otp",
        "variables": {
            "name": "Ada",
            "otp": "123456",
            "expiresIn": "10 minutes",
            "appName": "Playdoo"
        }
    }))
    .unwrap();
    assert_eq!(template.id(), TemplateId::Otp);

    let rendered = Renderer::new("Playdoo").render(&template).unwrap();

    assert!(rendered.subject.contains("123456"));
    assert!(rendered.html.contains("123456"));
    assert!(rendered.text.contains("123456"));
    assert!(rendered.text.contains("10 minutes"));
}

#[test]
fn unknown_template_name_is_rejected() {
    let result: Result<EmailTemplate, _> = serde_json::from_value(json!({
        "template": "newsletter",
        "variables": {}
    }));
    assert!(result.is_err());
    assert!(matches!(
        "newsletter".parse::<TemplateId>(),
        Err(TemplateError::NotFound(name)) if name == "newsletter"
    ));
}

#[test]
fn missing_variable_is_a_render_error() {
    let renderer = Renderer::new("Playdoo");
    let err = renderer
        .render_value(
            TemplateId::Otp,
            &json!({ "name": "Ada", "expiresIn": "10 minutes", "appName": "Playdoo" }),
        )
        .unwrap_err();

    assert!(matches!(err, TemplateError::Render { template: TemplateId::Otp, .. }));
}

#[test]
fn optional_cancellation_reason() {
    let renderer = Renderer::new("Playdoo");
    let vars = BookingCancellationVars {
        name: "Ada".into(),
        facility_name: "Court 3".into(),
        booking_date: "2024-05-01".into(),
        booking_reference: "BK-1042".into(),
        reason: None,
        app_name: "Playdoo".into(),
    };

    let without = renderer
        .render(&EmailTemplate::BookingCancellation(vars.clone()))
        .unwrap();
    assert_eq!(without.subject, "Booking cancelled: Court 3 on 2024-05-01");
    assert!(!without.text.contains("Reason:"));

    let with = renderer
        .render(&EmailTemplate::BookingCancellation(BookingCancellationVars {
            reason: Some("Maintenance".into()),
            ..vars
        }))
        .unwrap();
    assert!(with.text.contains("Reason: Maintenance"));
}

#[test]
fn every_builtin_template_precompiles() {
    let renderer = Renderer::new("Playdoo");
    assert_eq!(renderer.precompile_all().unwrap(), TemplateId::ALL.len());
    assert_eq!(renderer.templates().len(), TemplateId::ALL.len());
}
